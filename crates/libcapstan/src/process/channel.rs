use crate::channel::{channel, Receiver, Sender};
use crate::process::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("received unexpected message: {received:?}, expected: {expected:?}")]
    UnexpectedMessage {
        expected: Message,
        received: Message,
    },
    #[error("failed to receive. {msg:?}. {source:?}")]
    ReceiveError {
        msg: String,
        #[source]
        source: crate::channel::ChannelError,
    },
    #[error(transparent)]
    BaseChannelError(#[from] crate::channel::ChannelError),
}

// Channel Design
//
// The daemon and the forked helper process each hold one receiver and listen
// on it. The main channel carries error reports from the helper back to the
// daemon; the helper channel carries the single go-ahead message that
// releases the helper into exec'ing the snapshot tool. Each channel has
// exactly one send and one receive over its lifetime.

pub fn main_channel() -> Result<(MainSender, MainReceiver), ChannelError> {
    let (sender, receiver) = channel::<Message>()?;
    Ok((MainSender { sender }, MainReceiver { receiver }))
}

pub struct MainSender {
    sender: Sender<Message>,
}

impl MainSender {
    pub fn helper_error(&mut self, err: String) -> Result<(), ChannelError> {
        self.sender.send(Message::HelperError(err))?;

        Ok(())
    }

    pub fn close(self) -> Result<(), ChannelError> {
        self.sender.close()?;

        Ok(())
    }
}

pub struct MainReceiver {
    receiver: Receiver<Message>,
}

impl MainReceiver {
    /// Reads the error the helper reported before it exited. Errors out if
    /// the helper exited without reporting anything.
    pub fn wait_for_helper_error(&mut self) -> Result<String, ChannelError> {
        let msg = self
            .receiver
            .recv()
            .map_err(|err| ChannelError::ReceiveError {
                msg: "waiting for helper error report".to_string(),
                source: err,
            })?;

        match msg {
            Message::HelperError(err) => Ok(err),
            msg => Err(ChannelError::UnexpectedMessage {
                expected: Message::HelperError(String::new()),
                received: msg,
            }),
        }
    }

    pub fn close(self) -> Result<(), ChannelError> {
        self.receiver.close()?;

        Ok(())
    }
}

pub fn helper_channel() -> Result<(HelperSender, HelperReceiver), ChannelError> {
    let (sender, receiver) = channel::<Message>()?;
    Ok((HelperSender { sender }, HelperReceiver { receiver }))
}

pub struct HelperSender {
    sender: Sender<Message>,
}

impl HelperSender {
    /// Releases the helper process into exec'ing the snapshot tool. Must only
    /// be called after the helper's standard descriptors have been captured.
    pub fn exec_helper(&mut self) -> Result<(), ChannelError> {
        tracing::debug!("releasing snapshot helper");
        self.sender.send(Message::ExecHelper)?;

        Ok(())
    }

    pub fn close(self) -> Result<(), ChannelError> {
        self.sender.close()?;

        Ok(())
    }
}

pub struct HelperReceiver {
    receiver: Receiver<Message>,
}

impl HelperReceiver {
    // Wait until the daemon has captured the standard descriptor targets and
    // releases us.
    pub fn wait_for_exec(&mut self) -> Result<(), ChannelError> {
        let msg = self
            .receiver
            .recv()
            .map_err(|err| ChannelError::ReceiveError {
                msg: "waiting for exec go-ahead".to_string(),
                source: err,
            })?;
        match msg {
            Message::ExecHelper => Ok(()),
            msg => Err(ChannelError::UnexpectedMessage {
                expected: Message::ExecHelper,
                received: msg,
            }),
        }
    }

    pub fn close(self) -> Result<(), ChannelError> {
        self.receiver.close()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result};
    use nix::sys::wait;
    use nix::unistd;
    use serial_test::serial;

    use super::*;

    // Note: due to cargo test by default runs tests in parallel using a
    // single process, these tests should not be running in parallel with
    // other tests. Because we run tests in the same process, other tests may
    // decide to close down file descriptors or saturate the IOs in the OS.
    // The channel uses a socketpair to communicate and can potentially become
    // flaky as a result, so we run them in serial.

    #[test]
    #[serial]
    fn test_helper_release() -> Result<()> {
        let (mut sender, mut receiver) = helper_channel()?;
        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                sender
                    .exec_helper()
                    .with_context(|| "failed to send exec go-ahead")?;
                let status = wait::waitpid(child, None)?;
                assert!(matches!(status, wait::WaitStatus::Exited(_, 0)));
            }
            unistd::ForkResult::Child => {
                let code = match receiver.wait_for_exec() {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
        };

        Ok(())
    }

    #[test]
    #[serial]
    fn test_helper_error_report() -> Result<()> {
        let (mut sender, mut receiver) = main_channel()?;
        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                wait::waitpid(child, None)?;
                let err = receiver
                    .wait_for_helper_error()
                    .with_context(|| "failed to read helper error")?;
                assert_eq!(err, "exec failed");
            }
            unistd::ForkResult::Child => {
                sender.helper_error("exec failed".to_string())?;
                sender.close()?;
                std::process::exit(0);
            }
        };

        Ok(())
    }

    #[test]
    #[serial]
    fn test_helper_graceful_exit() -> Result<()> {
        let (sender, mut receiver) = main_channel()?;
        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                sender.close().context("failed to close sender")?;
                // The child exits without reporting an error. This should
                // cause wait_for_helper_error to error out instead of keep
                // blocking.
                let ret = receiver.wait_for_helper_error();
                assert!(ret.is_err());
                wait::waitpid(child, None)?;
            }
            unistd::ForkResult::Child => {
                receiver.close()?;
                std::process::exit(0);
            }
        };

        Ok(())
    }
}
