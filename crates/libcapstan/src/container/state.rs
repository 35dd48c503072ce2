//! Information about status and state of the container
use std::fmt::Display;
use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::NetworkConfig;

/// Network mode applied when a container record predates the mode field.
pub const DEFAULT_NETWORK_MODE: &str = "bridge";

/// Indicates status of the container
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    // The container exists but its init process has never been started
    #[default]
    Created,
    // The container init process is alive
    Running,
    // The container was dumped to an image directory and its live state
    // torn down
    Checkpointed,
    // The container process has exited
    Stopped,
    // The container is beyond recovery and only awaits removal
    Dead,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn can_checkpoint(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn can_restore(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Checkpointed | ContainerStatus::Stopped | ContainerStatus::Created
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Dead)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Checkpointed => "Checkpointed",
            Self::Stopped => "Stopped",
            Self::Dead => "Dead",
        };

        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to open container state file {state_file_path:?}")]
    OpenStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container state file {state_file_path:?}")]
    ParseStateFile {
        state_file_path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container state file {state_file_path:?}")]
    WriteStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, StateError>;

/// Host-level settings of a container that survive checkpoints.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Networking mode. An empty value is treated as the default bridge
    /// mode for records written before the field existed.
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
}

impl HostConfig {
    pub fn set_default_network_mode_if_blank(&mut self) {
        if self.network_mode.is_empty() {
            self.network_mode = DEFAULT_NETWORK_MODE.to_string();
        }
    }

    /// True when the container shares a namespace the engine cannot
    /// checkpoint: the host network or another container's network.
    pub fn shares_external_network(&self) -> bool {
        self.network_mode == "host" || self.network_mode.starts_with("container:")
    }
}

/// Static configuration used to launch the init process; restore resolves
/// the same structure the normal start path would.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

/// A bind mount whose source lives outside the container root filesystem.
/// Both sides of a checkpoint/restore cycle must declare these to the
/// snapshot tool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub destination: PathBuf,
    pub source: PathBuf,
}

/// Stores the state information of the container
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct State {
    // ID is the container ID
    pub id: String,
    // Status is the runtime status of the container.
    pub status: ContainerStatus,
    // Pid is the process ID of the container init process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    // Exit code of the init process once it has exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    // Path to the staged root filesystem.
    pub rootfs: PathBuf,
    #[serde(default)]
    pub host_config: HostConfig,
    #[serde(default)]
    pub config: ContainerConfig,
    // Network endpoints attached to the container.
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    // External bind mounts.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    // Resolved targets of the init process's standard descriptors, captured
    // around checkpoint/restore because the snapshot tool cannot recover
    // them on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_descriptors: Option<[String; 3]>,
    // Once set this stays set for the container's lifetime.
    #[serde(default)]
    pub has_been_checkpointed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpointed_at: Option<DateTime<Utc>>,
    // Creation time of the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl State {
    const STATE_FILE_PATH: &'static str = "state.json";

    pub fn new(container_id: &str, status: ContainerStatus, rootfs: PathBuf) -> Self {
        Self {
            id: container_id.to_string(),
            status,
            pid: None,
            exit_code: None,
            rootfs,
            host_config: HostConfig::default(),
            config: ContainerConfig::default(),
            networks: Vec::new(),
            mounts: Vec::new(),
            std_descriptors: None,
            has_been_checkpointed: false,
            checkpointed_at: None,
            created: Some(Utc::now()),
        }
    }

    pub fn save(&self, container_root: &Path) -> Result<()> {
        let state_file_path = Self::file_path(container_root);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&state_file_path)
            .map_err(|err| {
                tracing::error!(
                    state_file_path = ?state_file_path,
                    err = %err,
                    "failed to open container state file",
                );
                StateError::OpenStateFile {
                    state_file_path: state_file_path.to_owned(),
                    source: err,
                }
            })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to serialize container state",
            );
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;
        writer.flush().map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to write container state file",
            );
            StateError::WriteStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(())
    }

    pub fn load(container_root: &Path) -> Result<Self> {
        let state_file_path = Self::file_path(container_root);
        let state_file = File::open(&state_file_path).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to open container state file",
            );
            StateError::OpenStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        let state: Self = serde_json::from_reader(BufReader::new(state_file)).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to parse container state file",
            );
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(state)
    }

    /// Returns the path to the state JSON file for the provided
    /// `container_root`.
    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::STATE_FILE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_status() {
        let cstatus = ContainerStatus::default();
        assert_eq!(cstatus, ContainerStatus::Created);
        assert!(!cstatus.is_running());
        assert!(!cstatus.can_checkpoint());
        assert!(cstatus.can_restore());
        assert!(!cstatus.is_terminal());
    }

    #[test]
    fn test_running_status() {
        let cstatus = ContainerStatus::Running;
        assert!(cstatus.is_running());
        assert!(cstatus.can_checkpoint());
        assert!(!cstatus.can_restore());
        assert!(!cstatus.is_terminal());
    }

    #[test]
    fn test_checkpointed_status() {
        let cstatus = ContainerStatus::Checkpointed;
        assert!(!cstatus.is_running());
        assert!(!cstatus.can_checkpoint());
        assert!(cstatus.can_restore());
        assert!(!cstatus.is_terminal());
    }

    #[test]
    fn test_stopped_status() {
        let cstatus = ContainerStatus::Stopped;
        assert!(!cstatus.is_running());
        assert!(!cstatus.can_checkpoint());
        assert!(cstatus.can_restore());
        assert!(!cstatus.is_terminal());
    }

    #[test]
    fn test_dead_status() {
        let cstatus = ContainerStatus::Dead;
        assert!(!cstatus.is_running());
        assert!(!cstatus.can_checkpoint());
        assert!(!cstatus.can_restore());
        assert!(cstatus.is_terminal());
    }

    #[test]
    fn test_state_save_load_round_trip() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let mut state = State::new(
            "web",
            ContainerStatus::Running,
            PathBuf::from("/var/lib/capstan/rootfs/web"),
        );
        state.pid = Some(1234);
        state.has_been_checkpointed = true;
        state.checkpointed_at = Some(Utc::now());
        state.std_descriptors = Some([
            "/dev/null".to_string(),
            "pipe:[42]".to_string(),
            "pipe:[43]".to_string(),
        ]);
        state.networks.push(NetworkConfig::veth("eth0"));
        state.save(tmp_dir.path())?;

        let loaded = State::load(tmp_dir.path())?;
        assert_eq!(loaded.id, "web");
        assert_eq!(loaded.status, ContainerStatus::Running);
        assert_eq!(loaded.pid, Some(1234));
        assert!(loaded.has_been_checkpointed);
        assert_eq!(loaded.checkpointed_at, state.checkpointed_at);
        assert_eq!(loaded.std_descriptors, state.std_descriptors);
        assert_eq!(loaded.networks.len(), 1);

        Ok(())
    }

    #[test]
    fn test_state_load_missing() {
        let err = State::load(Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, StateError::OpenStateFile { .. }));
    }

    #[test]
    fn test_default_network_mode() {
        let mut host_config = HostConfig::default();
        assert!(host_config.network_mode.is_empty());
        host_config.set_default_network_mode_if_blank();
        assert_eq!(host_config.network_mode, DEFAULT_NETWORK_MODE);

        // An explicit mode is left alone.
        let mut host_config = HostConfig {
            network_mode: "none".to_string(),
            ..Default::default()
        };
        host_config.set_default_network_mode_if_blank();
        assert_eq!(host_config.network_mode, "none");
    }

    #[test]
    fn test_shares_external_network() {
        for (mode, shared) in [
            ("", false),
            ("bridge", false),
            ("none", false),
            ("host", true),
            ("container:db", true),
        ] {
            let host_config = HostConfig {
                network_mode: mode.to_string(),
                ..Default::default()
            };
            assert_eq!(host_config.shares_external_network(), shared, "mode {mode}");
        }
    }
}
