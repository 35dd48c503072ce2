//! Contains functionality of the checkpoint container command
use anyhow::Result;
use libcapstan::container::CheckpointOptions;
use libcapstan::daemon::Daemon;

use crate::cli::Checkpoint;
use crate::commands::for_each_container;

pub fn checkpoint(args: Checkpoint, daemon: &Daemon) -> Result<()> {
    let opts = CheckpointOptions {
        image_path: args.image_dir,
        work_path: args.work_dir,
        previous_image_path: None,
        leave_running: args.leave_running,
        tcp_established: args.allow_tcp,
        ext_unix_sk: args.allow_ext_unix,
        shell_job: args.allow_shell,
        file_locks: false,
    };

    for_each_container(daemon, &args.containers, "checkpoint", |daemon, name| {
        tracing::debug!(container = %name, "start checkpointing container");
        daemon.checkpoint(name, &opts)
    })
}
