use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed unix syscalls")]
    Nix(#[from] nix::Error),
    #[error("failed channel io")]
    Io(#[from] std::io::Error),
    #[error("failed serde serialization")]
    Serde(#[from] serde_json::Error),
    #[error("channel connection broken")]
    BrokenChannel,
}

// A single message is a serialized enum variant plus a short string; 8k is
// far above anything we ever put on the wire.
const MAX_MESSAGE_SIZE: usize = 8192;

pub struct Sender<T> {
    sender: File,
    phantom: PhantomData<T>,
}

pub struct Receiver<T> {
    receiver: File,
    phantom: PhantomData<T>,
}

impl<T> Sender<T>
where
    T: Serialize,
{
    pub fn send(&mut self, object: T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(&object)?;
        // The underlying socket is SOCK_SEQPACKET, so a single write either
        // transfers the whole message or fails; a short write means the peer
        // is gone.
        let written = self.sender.write(&payload)?;
        if written != payload.len() {
            return Err(ChannelError::BrokenChannel);
        }

        Ok(())
    }

    pub fn close(self) -> Result<(), ChannelError> {
        drop(self.sender);

        Ok(())
    }
}

impl<T> Receiver<T>
where
    T: serde::de::DeserializeOwned,
{
    // Recv the next message of type T. Blocks until the peer sends a message
    // or closes its end of the channel.
    pub fn recv(&mut self) -> Result<T, ChannelError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let bytes = self.receiver.read(&mut buf)?;
        match bytes {
            0 => Err(ChannelError::BrokenChannel),
            _ => Ok(serde_json::from_slice(&buf[..bytes])?),
        }
    }

    pub fn close(self) -> Result<(), ChannelError> {
        drop(self.receiver);

        Ok(())
    }
}

/// Creates a one-directional channel. Both ends survive a fork; each process
/// closes the end it does not use.
pub fn channel<T>() -> Result<(Sender<T>, Receiver<T>), ChannelError>
where
    T: for<'de> Deserialize<'de> + Serialize,
{
    // Use a seqpacket socketpair as the underlying pipe so message
    // boundaries are preserved.
    let (os_sender, os_receiver) = socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    let sender = Sender {
        sender: File::from(os_sender),
        phantom: PhantomData,
    };
    let receiver = Receiver {
        receiver: File::from(os_receiver),
        phantom: PhantomData,
    };

    Ok((sender, receiver))
}
