//! The daemon owns the container registry and is the entry point for the
//! checkpoint and restore operations. Each container handle carries its own
//! mutex; an operation holds that lock from entry to exit, so there is at
//! most one in-flight checkpoint or restore per container and never a
//! process-wide lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::container::{CheckpointOptions, Container, ContainerStatus, RestoreOptions};
use crate::error::EngineError;
use crate::network::DEFAULT_BRIDGE;
use crate::rootfs::{BindRootfs, RootfsDriver};

type ContainerHandle = Arc<Mutex<Container>>;

pub struct Daemon {
    // Data directory holding one record directory per container.
    root: PathBuf,
    // Name of the bridge restored veth peers attach to. Only ever read.
    bridge: String,
    rootfs_driver: Box<dyn RootfsDriver>,
    containers: Mutex<HashMap<String, ContainerHandle>>,
}

impl Daemon {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bridge: DEFAULT_BRIDGE.to_string(),
            rootfs_driver: Box::new(BindRootfs),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    pub fn with_rootfs_driver(mut self, driver: Box<dyn RootfsDriver>) -> Self {
        self.rootfs_driver = driver;
        self
    }

    /// Resolves a container by name, loading its record from disk on first
    /// use. The returned handle owns the per-container lock.
    pub fn get(&self, name: &str) -> Result<ContainerHandle, EngineError> {
        let mut containers = self
            .containers
            .lock()
            .map_err(|_| EngineError::Other("container registry lock poisoned".to_string()))?;

        if let Some(handle) = containers.get(name) {
            return Ok(handle.clone());
        }

        let container_root = self.root.join(name);
        if !container_root.exists() {
            return Err(EngineError::ContainerNotFound {
                id: name.to_string(),
            });
        }

        let container = Container::load(container_root)?;
        let handle = Arc::new(Mutex::new(container));
        containers.insert(name.to_string(), handle.clone());

        Ok(handle)
    }

    /// Checkpoints the named container. See [`Container::checkpoint`] for
    /// the exact semantics.
    pub fn checkpoint(&self, name: &str, opts: &CheckpointOptions) -> Result<(), EngineError> {
        let handle = self.get(name)?;
        let mut container = lock_container(&handle)?;

        container.checkpoint(opts, self.rootfs_driver.as_ref())?;
        tracing::info!(id = %name, event = "checkpoint", "container checkpointed");

        Ok(())
    }

    /// Restores the named container and hands the restored process to a
    /// monitor thread that records its eventual exit. Returns the new init
    /// pid.
    pub fn restore(&self, name: &str, opts: &mut RestoreOptions) -> Result<i32, EngineError> {
        let handle = self.get(name)?;
        let pid = {
            let mut container = lock_container(&handle)?;
            container.restore(opts, &self.bridge, self.rootfs_driver.as_ref())?
        };

        monitor_restored_process(handle, pid);

        Ok(pid.as_raw())
    }
}

fn lock_container(
    handle: &ContainerHandle,
) -> Result<std::sync::MutexGuard<'_, Container>, EngineError> {
    handle
        .lock()
        .map_err(|_| EngineError::Other("container lock poisoned".to_string()))
}

// Waits for the restored init process on a dedicated thread and records its
// exit in the container record, unless a newer operation has replaced the
// pid in the meantime.
fn monitor_restored_process(handle: ContainerHandle, pid: Pid) {
    std::thread::spawn(move || {
        let exit_code = wait_for_exit(pid).unwrap_or(255);

        let mut container = match handle.lock() {
            Ok(container) => container,
            Err(_) => {
                tracing::warn!(?pid, "container lock poisoned, dropping exit status");
                return;
            }
        };

        if container.state.pid != Some(pid.as_raw()) {
            return;
        }

        container.state.exit_code = Some(exit_code);
        container.set_status(ContainerStatus::Stopped);
        if let Err(err) = container.save() {
            tracing::warn!(id = ?container.id(), %err, "failed to record container exit");
        }
        tracing::debug!(id = ?container.id(), exit_code, "restored container exited");
    });
}

fn wait_for_exit(pid: Pid) -> Option<i32> {
    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
        Ok(_) => None,
        Err(Errno::ECHILD) => {
            // The restored process is not our child (it was re-parented or
            // the daemon restarted); fall back to watching it disappear. The
            // real exit status is unobservable in that case.
            while kill(pid, None::<Signal>).is_ok() {
                std::thread::sleep(Duration::from_millis(100));
            }
            None
        }
        Err(err) => {
            tracing::warn!(?pid, %err, "failed to wait for restored process");
            None
        }
    }
}
