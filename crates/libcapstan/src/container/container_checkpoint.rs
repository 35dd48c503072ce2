use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};

use super::{CheckpointOptions, Container, ContainerStatus};
use crate::criu;
use crate::error::EngineError;
use crate::rootfs::RootfsDriver;
use crate::stdio;

impl Container {
    /// Checkpoints the running container into `opts.image_path` using the
    /// snapshot tool. On success the record carries the checkpoint flag and
    /// timestamp; unless `leave_running` is set, the live container is torn
    /// down the same way a normal stop would.
    ///
    /// A failure during teardown does not undo a successful dump: the
    /// container stays marked Checkpointed and the error is only logged.
    pub fn checkpoint(
        &mut self,
        opts: &CheckpointOptions,
        rootfs_driver: &dyn RootfsDriver,
    ) -> Result<(), EngineError> {
        self.refresh_status()?;

        if !self.status().can_checkpoint() {
            tracing::error!(status = ?self.status(), id = ?self.id(), "cannot checkpoint container because it is not running");
            return Err(EngineError::NotRunning {
                id: self.id().to_string(),
                status: self.status(),
            });
        }

        opts.validate()?;

        if self.state.host_config.shares_external_network() {
            return Err(EngineError::BadOptions(format!(
                "cannot checkpoint a container with network mode {:?}",
                self.state.host_config.network_mode
            )));
        }

        create_private_dir(&opts.image_path)?;
        ensure_writable(&opts.image_path)?;
        if let Some(work_path) = &opts.work_path {
            create_private_dir(work_path)?;
        }

        let pid = self.pid().ok_or_else(|| {
            EngineError::Other("container init process pid not found in state".to_string())
        })?;

        // Remember where std{in,out,err} pointed. The pipes behind them are
        // destroyed by the dump, and restore must map the image's pipe
        // entries onto freshly inherited descriptors.
        let descriptors = stdio::snapshot_std_descriptors(pid.as_raw());
        stdio::write_descriptors_file(&opts.image_path, &descriptors)?;
        self.state.std_descriptors = Some(descriptors);

        criu::dump(&self.state.rootfs, pid.as_raw(), opts, &self.state.mounts)?;

        self.state.has_been_checkpointed = true;
        self.state.checkpointed_at = Some(Utc::now());

        if !opts.leave_running {
            if let Err(err) = self.teardown(rootfs_driver) {
                // The dump is intact; a teardown hiccup must not fail the
                // operation or mask its success.
                tracing::warn!(id = ?self.id(), %err, "cleanup after checkpoint failed");
            }
            self.set_status(ContainerStatus::Checkpointed);
        }

        self.save()?;
        tracing::debug!(id = ?self.id(), "container checkpointed");

        Ok(())
    }

    // Tears down the live container after a dump: init process killed,
    // namespaces released with it, rootfs unmounted. The veth endpoints die
    // with the container's network namespace.
    fn teardown(&mut self, rootfs_driver: &dyn RootfsDriver) -> Result<(), EngineError> {
        if let Some(pid) = self.pid() {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => (),
                Err(err) => {
                    return Err(EngineError::Other(format!(
                        "failed to kill init process {pid}: {err}"
                    )))
                }
            }
            // Reap if the process is our child; ECHILD means something else
            // (or nobody) owns it, which is fine here.
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        }

        for network in &self.state.networks {
            tracing::debug!(id = ?self.id(), driver = %network.driver, "released network endpoint");
        }

        rootfs_driver.unmount(&self.state.rootfs)?;

        Ok(())
    }
}

// Image and work directories are created for the daemon only. An existing
// directory is reused as-is.
fn create_private_dir(path: &Path) -> Result<(), EngineError> {
    if let Err(err) = DirBuilder::new().recursive(true).mode(0o700).create(path) {
        if err.kind() != ErrorKind::AlreadyExists {
            tracing::error!(?path, ?err, "failed to create checkpoint directory");
            return Err(EngineError::OtherIO(err));
        }
    }

    Ok(())
}

fn ensure_writable(path: &Path) -> Result<(), EngineError> {
    let metadata = std::fs::metadata(path)?;
    if metadata.permissions().readonly() {
        return Err(EngineError::BadOptions(format!(
            "image directory {path:?} is not writable"
        )));
    }

    Ok(())
}
