//! Contains functionality of the restore container command
use anyhow::Result;
use libcapstan::container::RestoreOptions;
use libcapstan::daemon::Daemon;

use crate::cli::Restore;
use crate::commands::for_each_container;

pub fn restore(args: Restore, daemon: &Daemon) -> Result<()> {
    for_each_container(daemon, &args.containers, "restore", |daemon, name| {
        // Established tcp connections, external unix sockets and file locks
        // are always restored; a dump that contains none of them is not
        // affected by the flags.
        let mut opts = RestoreOptions {
            image_path: args.image_dir.clone(),
            work_path: args.work_dir.clone(),
            tcp_established: true,
            ext_unix_sk: true,
            shell_job: false,
            file_locks: true,
            force: args.force,
            veth_pairs: Vec::new(),
        };

        tracing::debug!(container = %name, "start restoring container");
        let pid = daemon.restore(name, &mut opts)?;
        tracing::debug!(container = %name, pid, "container restored");
        Ok(())
    })
}
