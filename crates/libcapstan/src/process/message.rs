use core::fmt;

use serde::{Deserialize, Serialize};

/// Used as a wrapper for messages to be sent between the daemon and the
/// forked helper process that will exec the snapshot tool.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Message {
    ExecHelper,
    HelperError(String),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::ExecHelper => write!(f, "ExecHelper"),
            Message::HelperError(err) => write!(f, "HelperError({})", err),
        }
    }
}
