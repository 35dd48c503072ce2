pub mod channel;
pub mod message;
pub mod restore_process;

pub use restore_process::{restore_main_process, ProcessError};
