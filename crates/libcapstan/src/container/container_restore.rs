use std::io;
use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{Container, ContainerStatus, Mount, RestoreOptions};
use crate::criu;
use crate::error::EngineError;
use crate::network;
use crate::rootfs::RootfsDriver;
use crate::stdio;

/// Launch structure for the init process, resolved the same way a fresh
/// start resolves it. Restore only consumes the mount set (for the external
/// mount remapping) but the whole structure is computed so a restored
/// container cannot drift from a started one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub mounts: Vec<Mount>,
}

const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

impl Container {
    /// Restores the container from a previously written image directory.
    ///
    /// The ordering in here is load-bearing: the rootfs must be mounted
    /// before networking is planned, networking before the helper runs, and
    /// the pid readback strictly after the helper exits. On any failure
    /// after the mount the container record is marked failed (exit code at
    /// least 128) and transient state is unwound; the image directory is
    /// left alone because a partial restore is still useful for diagnosis.
    pub fn restore(
        &mut self,
        opts: &mut RestoreOptions,
        bridge: &str,
        rootfs_driver: &dyn RootfsDriver,
    ) -> Result<Pid, EngineError> {
        self.refresh_status()?;

        if self.status().is_terminal() {
            return Err(EngineError::Other(format!(
                "container {} is dead and cannot be restored",
                self.id()
            )));
        }

        if !opts.force {
            if self.status().is_running() {
                tracing::error!(id = ?self.id(), "cannot restore container because it is already running");
                return Err(EngineError::AlreadyRunning {
                    id: self.id().to_string(),
                });
            }
            if !self.state.has_been_checkpointed {
                tracing::error!(id = ?self.id(), "cannot restore container because it was never checkpointed");
                return Err(EngineError::NotCheckpointed {
                    id: self.id().to_string(),
                });
            }
        }

        opts.validate()?;

        if !opts.image_path.is_dir() {
            return Err(EngineError::OtherIO(io::Error::new(
                io::ErrorKind::NotFound,
                format!("image directory {:?} does not exist", opts.image_path),
            )));
        }

        rootfs_driver.mount(&self.state.rootfs)?;

        // Unwinds the mount on every failure path, including panics inside
        // the helper orchestration. Defused on success.
        let rootfs = self.state.rootfs.clone();
        let unmount_guard = scopeguard::guard((), |()| {
            if let Err(err) = rootfs_driver.unmount(&rootfs) {
                tracing::warn!(%err, "failed to unmount rootfs while unwinding restore");
            }
        });

        match self.restore_inner(opts, bridge) {
            Ok(pid) => {
                scopeguard::ScopeGuard::into_inner(unmount_guard);
                Ok(pid)
            }
            Err(err) => {
                tracing::error!(id = ?self.id(), %err, "restoring container failed");
                // Make sure the record does not read as a clean exit.
                if self.state.exit_code.unwrap_or(0) == 0 {
                    self.state.exit_code = Some(128);
                }
                if let Err(save_err) = self.save() {
                    tracing::warn!(%save_err, "failed to persist state after restore failure");
                }
                Err(err)
            }
        }
    }

    fn restore_inner(
        &mut self,
        opts: &mut RestoreOptions,
        bridge: &str,
    ) -> Result<Pid, EngineError> {
        // Records written by older daemons may carry a blank network mode.
        self.state.host_config.set_default_network_mode_if_blank();

        if self.state.host_config.shares_external_network() {
            return Err(EngineError::BadOptions(format!(
                "cannot restore a container with network mode {:?}",
                self.state.host_config.network_mode
            )));
        }

        // Networking is initialized as for a fresh start except for the
        // final step: the new veth is NOT moved into the container. The
        // snapshot tool re-creates the pair itself from the plan below.
        opts.veth_pairs = network::plan_reattachment(&self.state.networks, bridge)?;

        let command = self.resolve_init_command();

        // The record normally carries the targets saved at checkpoint time;
        // fall back to the sidecar in the image directory for records that
        // lost them.
        if self.state.std_descriptors.is_none() {
            match stdio::load_descriptors_file(&opts.image_path) {
                Ok(descriptors) => self.state.std_descriptors = Some(descriptors),
                Err(err) => {
                    tracing::debug!(%err, "no descriptor sidecar in image directory");
                }
            }
        }

        let outcome = criu::restore(
            &self.state.rootfs,
            opts,
            &command.mounts,
            self.state.std_descriptors.as_ref(),
        )?;

        // What the helper inherited is what the next checkpoint will see.
        self.state.std_descriptors = Some(outcome.std_descriptors);
        self.set_pid(outcome.restored_pid);
        self.set_status(ContainerStatus::Running);
        self.state.exit_code = None;

        if let Err(err) = self.save() {
            // The process came back but the daemon lost track of it. Kill it
            // rather than leave an untracked container running.
            tracing::error!(id = ?self.id(), pid = outcome.restored_pid, %err, "bookkeeping failed after restore, terminating restored process");
            let _ = kill(Pid::from_raw(outcome.restored_pid), Signal::SIGKILL);
            return Err(err);
        }

        tracing::info!(
            id = %self.id(),
            pid = outcome.restored_pid,
            event = "restore",
            "container restored"
        );

        Ok(Pid::from_raw(outcome.restored_pid))
    }

    /// Resolves environment, working directory and mount set for the init
    /// process exactly as the normal start path would.
    pub fn resolve_init_command(&self) -> InitCommand {
        let mut env = self.state.config.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(DEFAULT_PATH_ENV.to_string());
        }
        env.push(format!("HOSTNAME={}", self.id()));

        let cwd = match self.state.config.working_dir.as_str() {
            "" => PathBuf::from("/"),
            dir => PathBuf::from(dir),
        };

        InitCommand {
            env,
            cwd,
            mounts: self.state.mounts.clone(),
        }
    }
}
