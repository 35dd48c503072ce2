use std::ffi::CString;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};

use crate::process::channel::{
    helper_channel, main_channel, HelperReceiver, MainSender,
};
use crate::stdio;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Channel(#[from] crate::process::channel::ChannelError),
    #[error("failed to fork helper process")]
    Fork(#[source] nix::Error),
    #[error("failed to wait for helper process")]
    Wait(#[source] nix::Error),
    #[error("failed to capture helper standard descriptors")]
    CaptureDescriptors(#[source] std::io::Error),
    #[error("snapshot helper failed: {0}")]
    HelperFailed(String),
}

type Result<T> = std::result::Result<T, ProcessError>;

/// Handle to a forked helper process. Dropping the handle without reaping it
/// kills the helper, so a cancelled or failed restore never leaks a detached
/// snapshot tool.
struct HelperProcess {
    pid: Pid,
    reaped: bool,
}

impl HelperProcess {
    fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(ProcessError::Wait)?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        tracing::warn!(pid = ?self.pid, "killing unreaped snapshot helper");
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

/// Forks the process that will exec the snapshot tool and synchronizes with
/// it: the helper stays blocked until the daemon has captured the targets of
/// its standard descriptors, because the tool will replace or close them the
/// moment it starts.
///
/// Returns the three captured descriptor targets once the tool has exited
/// with status zero.
pub fn restore_main_process(tool_path: &Path, args: &[String]) -> Result<[String; 3]> {
    let (main_sender, mut main_receiver) = main_channel()?;
    let (mut helper_sender, helper_receiver) = helper_channel()?;

    match unsafe { fork() }.map_err(ProcessError::Fork)? {
        ForkResult::Child => {
            // Close down the ends owned by the daemon.
            let _ = main_receiver.close();
            let _ = helper_sender.close();
            let err = helper_exec_process(tool_path, args, helper_receiver, main_sender);
            // Only reachable when the exec failed; the error has already been
            // reported through the channel.
            tracing::error!(%err, "snapshot helper could not exec");
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            // Close down the ends now owned by the helper.
            main_sender.close()?;
            helper_receiver.close()?;

            let mut helper = HelperProcess::new(child);

            // The helper is blocked reading the channel, so its descriptors
            // are still the ones it inherited from us. Capture them before
            // letting it run.
            let std_descriptors = stdio::read_std_descriptors(child.as_raw())
                .map_err(ProcessError::CaptureDescriptors)?;

            helper_sender.exec_helper()?;
            helper_sender.close()?;

            match helper.wait()? {
                WaitStatus::Exited(_, 0) => Ok(std_descriptors),
                status => {
                    // The helper reports pre-exec failures over the channel
                    // before exiting; prefer that message over the bare wait
                    // status.
                    let detail = main_receiver
                        .wait_for_helper_error()
                        .unwrap_or_else(|_| format!("helper exited with {:?}", status));
                    Err(ProcessError::HelperFailed(detail))
                }
            }
        }
    }
}

// Runs inside the forked helper. Blocks until the daemon releases us, then
// replaces this process image with the snapshot tool. Returns only on error.
fn helper_exec_process(
    tool_path: &Path,
    args: &[String],
    mut receiver: HelperReceiver,
    mut main_sender: MainSender,
) -> ProcessError {
    let err = match exec_tool(tool_path, args, &mut receiver) {
        Ok(never) => match never {},
        Err(err) => err,
    };

    let _ = main_sender.helper_error(err.to_string());
    let _ = main_sender.close();
    let _ = receiver.close();
    err
}

enum Never {}

fn exec_tool(
    tool_path: &Path,
    args: &[String],
    receiver: &mut HelperReceiver,
) -> std::result::Result<Never, ProcessError> {
    receiver.wait_for_exec()?;

    let path = CString::new(tool_path.to_string_lossy().as_bytes())
        .map_err(|err| ProcessError::HelperFailed(format!("invalid tool path: {err}")))?;
    let mut argv = vec![path.clone()];
    for arg in args {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|err| ProcessError::HelperFailed(format!("invalid argument: {err}")))?,
        );
    }

    execv(&path, &argv)
        .map_err(|err| ProcessError::HelperFailed(format!("execv {tool_path:?}: {err}")))?;
    unreachable!("execv returned without error")
}
