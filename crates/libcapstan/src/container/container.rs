use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use procfs::process::Process;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerStatus, State};
use crate::error::EngineError;
use crate::network::VethPeerPlan;

/// Structure representing the container data
#[derive(Debug, Clone)]
pub struct Container {
    // State of the container
    pub state: State,
    // Directory holding the container's record in the daemon data dir
    pub root: PathBuf,
}

impl Default for Container {
    fn default() -> Self {
        Self {
            state: State::default(),
            root: PathBuf::from("/run/capstan"),
        }
    }
}

impl Container {
    pub fn new(
        container_id: &str,
        status: ContainerStatus,
        rootfs: &Path,
        container_root: &Path,
    ) -> Result<Self, EngineError> {
        let container_root = fs::canonicalize(container_root).map_err(|err| {
            EngineError::BadOptions(format!(
                "invalid container root {container_root:?}: {err:?}"
            ))
        })?;
        let state = State::new(container_id, status, rootfs.to_path_buf());

        Ok(Self {
            state,
            root: container_root,
        })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    pub fn set_status(&mut self, status: ContainerStatus) -> &mut Self {
        self.state.status = status;
        self
    }

    pub fn pid(&self) -> Option<Pid> {
        self.state.pid.map(Pid::from_raw)
    }

    pub fn set_pid(&mut self, pid: i32) -> &mut Self {
        self.state.pid = Some(pid);
        self
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.state.created
    }

    pub fn rootfs(&self) -> &Path {
        &self.state.rootfs
    }

    pub fn has_been_checkpointed(&self) -> bool {
        self.state.has_been_checkpointed
    }

    /// Re-derives the lifecycle status from the recorded init pid. A
    /// recorded pid whose process is gone means the container stopped;
    /// Checkpointed and Dead are sticky because the process is expected to
    /// be gone in those states.
    pub fn refresh_status(&mut self) -> Result<(), EngineError> {
        let new_status = match self.pid() {
            Some(pid) => {
                // Note that Process::new does not spawn a new process
                // but instead creates a new Process structure, and fills
                // it with information about the process with given pid
                if let Ok(proc) = Process::new(pid.as_raw()) {
                    use procfs::process::ProcState;

                    match proc.stat()?.state()? {
                        ProcState::Zombie | ProcState::Dead => self.stopped_status(),
                        _ => match self.status() {
                            ContainerStatus::Created => ContainerStatus::Created,
                            _ => ContainerStatus::Running,
                        },
                    }
                } else {
                    self.stopped_status()
                }
            }
            None => self.stopped_status(),
        };

        self.set_status(new_status);
        Ok(())
    }

    fn stopped_status(&self) -> ContainerStatus {
        match self.status() {
            ContainerStatus::Checkpointed => ContainerStatus::Checkpointed,
            ContainerStatus::Dead => ContainerStatus::Dead,
            _ => ContainerStatus::Stopped,
        }
    }

    pub fn load(container_root: PathBuf) -> Result<Self, EngineError> {
        let state = State::load(&container_root)?;
        let mut container = Self {
            state,
            root: container_root,
        };
        container.refresh_status()?;
        Ok(container)
    }

    pub fn save(&self) -> Result<(), EngineError> {
        tracing::debug!(id = self.id(), root = ?self.root, "saving container state");
        self.state.save(&self.root)?;

        Ok(())
    }
}

/// Checkpoint parameter structure. Unknown fields in a serialized request
/// are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CheckpointOptions {
    pub image_path: PathBuf,
    #[serde(default)]
    pub work_path: Option<PathBuf>,
    #[serde(default)]
    pub previous_image_path: Option<PathBuf>,
    #[serde(default)]
    pub leave_running: bool,
    #[serde(default)]
    pub tcp_established: bool,
    #[serde(default)]
    pub ext_unix_sk: bool,
    #[serde(default)]
    pub shell_job: bool,
    #[serde(default)]
    pub file_locks: bool,
}

impl CheckpointOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        require_absolute(&self.image_path, "image directory")?;
        if let Some(work) = &self.work_path {
            require_absolute(work, "work directory")?;
        }
        if let Some(prev) = &self.previous_image_path {
            require_absolute(prev, "previous image directory")?;
        }

        Ok(())
    }
}

/// Restore parameter structure; a superset of the checkpoint options. The
/// veth pair plans are filled in by the engine, not by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestoreOptions {
    pub image_path: PathBuf,
    #[serde(default)]
    pub work_path: Option<PathBuf>,
    #[serde(default)]
    pub tcp_established: bool,
    #[serde(default)]
    pub ext_unix_sk: bool,
    #[serde(default)]
    pub shell_job: bool,
    #[serde(default)]
    pub file_locks: bool,
    /// Bypasses the running/has-been-checkpointed preconditions.
    #[serde(default)]
    pub force: bool,
    #[serde(skip)]
    pub veth_pairs: Vec<VethPeerPlan>,
}

impl RestoreOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        require_absolute(&self.image_path, "image directory")?;
        if let Some(work) = &self.work_path {
            require_absolute(work, "work directory")?;
        }

        Ok(())
    }
}

fn require_absolute(path: &Path, what: &str) -> Result<(), EngineError> {
    if !path.is_absolute() {
        return Err(EngineError::BadOptions(format!(
            "{what} path must be absolute, got {path:?}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_get_set_pid() {
        let mut container = Container::default();

        assert_eq!(container.pid(), None);
        container.set_pid(1);
        assert_eq!(container.pid(), Some(Pid::from_raw(1)));
    }

    #[test]
    fn test_basic_getter() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let container = Container::new(
            "container_id",
            ContainerStatus::Created,
            Path::new("/var/lib/capstan/rootfs/container_id"),
            tmp_dir.path(),
        )?;

        assert_eq!(container.id(), "container_id");
        assert_eq!(
            container.rootfs(),
            Path::new("/var/lib/capstan/rootfs/container_id")
        );
        assert_eq!(container.root, fs::canonicalize(tmp_dir.path())?);
        assert!(container.created().is_some());
        assert!(!container.has_been_checkpointed());

        Ok(())
    }

    #[test]
    fn test_refresh_load_save_state() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let mut container_1 = Container::new(
            "container_id_1",
            ContainerStatus::Created,
            Path::new("/rootfs"),
            tmp_dir.path(),
        )?;

        container_1.save()?;
        let container_2 = Container::load(tmp_dir.path().to_path_buf())?;
        assert_eq!(container_1.state.id, container_2.state.id);
        // No pid recorded, so a reload derives Stopped.
        assert_eq!(container_2.state.status, ContainerStatus::Stopped);

        Ok(())
    }

    #[test]
    fn test_get_set_refresh_status() -> Result<()> {
        let mut container = Container::default();
        assert_eq!(container.status(), ContainerStatus::Created);

        // no PID case
        container.refresh_status()?;
        assert_eq!(container.status(), ContainerStatus::Stopped);

        // with PID case but PID not exists
        container.set_pid(-1);
        container.refresh_status()?;
        assert_eq!(container.status(), ContainerStatus::Stopped);

        // with live PID case
        container.set_pid(std::process::id() as i32);
        container.set_status(ContainerStatus::Running);
        container.refresh_status()?;
        assert_eq!(container.status(), ContainerStatus::Running);

        Ok(())
    }

    #[test]
    fn test_checkpointed_status_is_sticky() -> Result<()> {
        // A checkpointed container's init process is gone by design; a
        // status refresh must not demote it to plain Stopped.
        let mut container = Container::default();
        container.set_pid(-1);
        container.set_status(ContainerStatus::Checkpointed);
        container.refresh_status()?;
        assert_eq!(container.status(), ContainerStatus::Checkpointed);

        Ok(())
    }

    #[test]
    fn test_options_reject_relative_paths() {
        let opts = CheckpointOptions {
            image_path: PathBuf::from("rel/path"),
            work_path: None,
            previous_image_path: None,
            leave_running: false,
            tcp_established: false,
            ext_unix_sk: false,
            shell_job: false,
            file_locks: false,
        };
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, EngineError::BadOptions(_)));
        assert!(err.to_string().contains("must be absolute"));

        let opts = RestoreOptions {
            image_path: PathBuf::from("/abs"),
            work_path: Some(PathBuf::from("rel")),
            tcp_established: false,
            ext_unix_sk: false,
            shell_job: false,
            file_locks: false,
            force: false,
            veth_pairs: Vec::new(),
        };
        assert!(matches!(
            opts.validate().unwrap_err(),
            EngineError::BadOptions(_)
        ));
    }

    #[test]
    fn test_options_reject_unknown_fields() {
        let err = serde_json::from_str::<CheckpointOptions>(
            r#"{"imagePath": "/tmp/cp", "bogusKnob": true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogusKnob"));
    }
}
