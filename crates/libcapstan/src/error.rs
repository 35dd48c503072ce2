use crate::container::ContainerStatus;

/// Top level error for the engine library. The state machine preconditions
/// (`NotRunning`, `AlreadyRunning`, `NotCheckpointed`) are surfaced verbatim
/// to the caller; everything else is wrapped from the module it occurred in.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container {id} does not exist")]
    ContainerNotFound { id: String },
    #[error("container {id} is not running (status: {status})")]
    NotRunning { id: String, status: ContainerStatus },
    #[error("container {id} is already running")]
    AlreadyRunning { id: String },
    #[error("container {id} has not been checkpointed")]
    NotCheckpointed { id: String },
    #[error("invalid options: {0}")]
    BadOptions(String),
    #[error("snapshot helper failed: {0}")]
    HelperFailed(String),
    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),
    #[error(transparent)]
    Rootfs(#[from] crate::rootfs::RootfsError),
    #[error(transparent)]
    State(#[from] crate::container::StateError),
    #[error("io error: {0}")]
    OtherIO(#[from] std::io::Error),
    #[error("failed to get proc state")]
    Procfs(#[from] procfs::ProcError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
