//! Driver for the external snapshot tool (criu). Translates engine options
//! into the tool's argument vector and supervises its execution. This module
//! has no container-level knowledge; the coordinator hands it everything it
//! needs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::OnceCell;

use crate::container::{CheckpointOptions, Mount, RestoreOptions};
use crate::error::EngineError;
use crate::process::{restore_main_process, ProcessError};
use crate::stdio;

pub const CRIU_BINARY: &str = "criu";
pub const DUMP_LOG_FILE: &str = "dump.log";
pub const RESTORE_LOG_FILE: &str = "restore.log";
pub const PID_FILE: &str = "restore.pid";

const LOG_LEVEL: &str = "-v4";
const LOG_TAIL_BYTES: usize = 1024;

static CRIU_PATH: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Result of a successful restore run: the pid the tool wrote to its pid
/// file and the stdio targets captured from the helper before it exec'd.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub restored_pid: i32,
    pub std_descriptors: [String; 3],
}

/// Absolute path of the snapshot tool. The executable search path is scanned
/// once per daemon lifetime and the result cached.
pub fn criu_path() -> Result<&'static Path, EngineError> {
    let cached = CRIU_PATH.get_or_init(|| {
        std::env::var_os("PATH").and_then(|path| search_path(&path, CRIU_BINARY))
    });
    cached.as_deref().ok_or_else(|| {
        EngineError::HelperFailed(format!("{CRIU_BINARY} not found in PATH"))
    })
}

fn search_path(path_var: &std::ffi::OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Builds the argument vector for a dump.
pub fn dump_args(
    rootfs: &Path,
    init_pid: i32,
    opts: &CheckpointOptions,
    mounts: &[Mount],
) -> Vec<String> {
    let mut args = vec![
        "dump".to_string(),
        LOG_LEVEL.to_string(),
        "-D".to_string(),
        opts.image_path.to_string_lossy().into_owned(),
        "-o".to_string(),
        DUMP_LOG_FILE.to_string(),
        "--root".to_string(),
        rootfs.to_string_lossy().into_owned(),
        "--manage-cgroups".to_string(),
        "--evasive-devices".to_string(),
        "-t".to_string(),
        init_pid.to_string(),
    ];

    if opts.tcp_established {
        args.push("--tcp-established".to_string());
    }
    if opts.ext_unix_sk {
        args.push("--ext-unix-sk".to_string());
    }
    if opts.shell_job {
        args.push("--shell-job".to_string());
    }
    if opts.file_locks {
        args.push("--file-locks".to_string());
    }
    if opts.leave_running {
        args.push("--leave-running".to_string());
    }
    if let Some(prev) = &opts.previous_image_path {
        args.push("--prev-images-dir".to_string());
        args.push(prev.to_string_lossy().into_owned());
    }
    if let Some(work) = &opts.work_path {
        args.push("-W".to_string());
        args.push(work.to_string_lossy().into_owned());
    }

    // The tool fails a dump unless every bind mount reaching outside the
    // container root is declared external. The key equals the destination so
    // the restore side can remap it.
    for mount in mounts {
        args.push("--ext-mount-map".to_string());
        args.push(format!(
            "{}:{}",
            mount.destination.display(),
            mount.destination.display()
        ));
    }

    args
}

/// Builds the argument vector for a restore. The inverse of [`dump_args`]:
/// external mounts map their destination back to the real host source, the
/// planned veth pairs are handed over for re-creation, and stdio pipes the
/// dump recorded are redirected to inherited descriptors.
pub fn restore_args(
    rootfs: &Path,
    opts: &RestoreOptions,
    mounts: &[Mount],
    std_descriptors: Option<&[String; 3]>,
) -> Vec<String> {
    let mut args = vec![
        "restore".to_string(),
        "-d".to_string(),
        LOG_LEVEL.to_string(),
        "-D".to_string(),
        opts.image_path.to_string_lossy().into_owned(),
        "-o".to_string(),
        RESTORE_LOG_FILE.to_string(),
        "--pidfile".to_string(),
        PID_FILE.to_string(),
        "--root".to_string(),
        rootfs.to_string_lossy().into_owned(),
        "--manage-cgroups".to_string(),
        "--evasive-devices".to_string(),
    ];

    if opts.tcp_established {
        args.push("--tcp-established".to_string());
    }
    if opts.ext_unix_sk {
        args.push("--ext-unix-sk".to_string());
    }
    if opts.shell_job {
        args.push("--shell-job".to_string());
    }
    if opts.file_locks {
        args.push("--file-locks".to_string());
    }
    if let Some(work) = &opts.work_path {
        args.push("-W".to_string());
        args.push(work.to_string_lossy().into_owned());
    }

    for mount in mounts {
        args.push("--ext-mount-map".to_string());
        args.push(format!(
            "{}:{}",
            mount.destination.display(),
            mount.source.display()
        ));
    }

    for plan in &opts.veth_pairs {
        args.push("--veth-pair".to_string());
        args.push(plan.pair_spec());
    }

    // Pipes that backed std{in,out,err} before the checkpoint are gone; the
    // tool must use the descriptors the helper inherited from us instead.
    if let Some(descriptors) = std_descriptors {
        for (i, target) in descriptors.iter().enumerate() {
            if target.starts_with(stdio::PIPE_LINK_PREFIX) {
                args.push("--inherit-fd".to_string());
                args.push(format!("fd[{i}]:{target}"));
            }
        }
    }

    args
}

/// Checkpoints the process tree rooted at `init_pid` into the image
/// directory. Returns `HelperFailed` with the log tail when the tool exits
/// non-zero.
pub fn dump(
    rootfs: &Path,
    init_pid: i32,
    opts: &CheckpointOptions,
    mounts: &[Mount],
) -> Result<(), EngineError> {
    let tool = criu_path()?;
    let args = dump_args(rootfs, init_pid, opts, mounts);
    tracing::debug!(?tool, ?args, "running snapshot tool");

    let output = Command::new(tool).args(&args).output()?;
    log_tool_output(&output.stdout, &output.stderr);

    if !output.status.success() {
        return Err(EngineError::HelperFailed(format!(
            "{CRIU_BINARY} dump exited with {}: {}",
            output.status,
            log_tail(&output.stderr)
        )));
    }

    Ok(())
}

/// Restores a container from the image directory. The tool is exec'd by a
/// forked helper that stalls until the caller's side has captured the
/// helper's standard descriptor targets; see `process::restore_main_process`.
pub fn restore(
    rootfs: &Path,
    opts: &RestoreOptions,
    mounts: &[Mount],
    saved_descriptors: Option<&[String; 3]>,
) -> Result<RestoreOutcome, EngineError> {
    let tool = criu_path()?;

    // A pid file left behind by an earlier attempt would fake a success.
    remove_stale_pid_file(&opts.image_path)?;

    let args = restore_args(rootfs, opts, mounts, saved_descriptors);
    tracing::debug!(?tool, ?args, "running snapshot tool through sync helper");

    let std_descriptors = restore_main_process(tool, &args).map_err(|err| match err {
        ProcessError::HelperFailed(msg) => EngineError::HelperFailed(msg),
        ProcessError::CaptureDescriptors(io) => EngineError::OtherIO(io),
        other => EngineError::Other(other.to_string()),
    })?;

    let pid_file = opts.image_path.join(PID_FILE);
    let restored_pid = stdio::read_restore_pid(&pid_file).map_err(|err| {
        EngineError::HelperFailed(format!("cannot read restored pid: {err}"))
    })?;

    Ok(RestoreOutcome {
        restored_pid,
        std_descriptors,
    })
}

fn remove_stale_pid_file(image_dir: &Path) -> Result<(), EngineError> {
    match std::fs::remove_file(image_dir.join(PID_FILE)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::OtherIO(err)),
    }
}

fn log_tool_output(stdout: &[u8], stderr: &[u8]) {
    if !stdout.is_empty() {
        tracing::debug!(output = %String::from_utf8_lossy(stdout), "snapshot tool stdout");
    }
    if !stderr.is_empty() {
        tracing::debug!(output = %String::from_utf8_lossy(stderr), "snapshot tool stderr");
    }
}

fn log_tail(bytes: &[u8]) -> String {
    let tail = if bytes.len() > LOG_TAIL_BYTES {
        &bytes[bytes.len() - LOG_TAIL_BYTES..]
    } else {
        bytes
    };
    String::from_utf8_lossy(tail).trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;

    use super::*;
    use crate::network::VethPeerPlan;

    fn checkpoint_opts() -> CheckpointOptions {
        CheckpointOptions {
            image_path: PathBuf::from("/tmp/cp/web"),
            work_path: None,
            previous_image_path: None,
            leave_running: false,
            tcp_established: false,
            ext_unix_sk: false,
            shell_job: false,
            file_locks: false,
        }
    }

    fn restore_opts() -> RestoreOptions {
        RestoreOptions {
            image_path: PathBuf::from("/tmp/cp/web"),
            work_path: None,
            tcp_established: false,
            ext_unix_sk: false,
            shell_job: false,
            file_locks: false,
            force: false,
            veth_pairs: Vec::new(),
        }
    }

    fn mounts() -> Vec<Mount> {
        vec![
            Mount {
                destination: PathBuf::from("/data"),
                source: PathBuf::from("/var/lib/capstan/volumes/data"),
            },
            Mount {
                destination: PathBuf::from("/etc/hosts"),
                source: PathBuf::from("/var/lib/capstan/containers/web/hosts"),
            },
        ]
    }

    #[test]
    fn test_dump_args_fixed_tokens() {
        let args = dump_args(Path::new("/var/lib/capstan/rootfs/web"), 4321, &checkpoint_opts(), &[]);
        let expected: Vec<String> = [
            "dump",
            "-v4",
            "-D",
            "/tmp/cp/web",
            "-o",
            "dump.log",
            "--root",
            "/var/lib/capstan/rootfs/web",
            "--manage-cgroups",
            "--evasive-devices",
            "-t",
            "4321",
        ]
        .map(String::from)
        .to_vec();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_dump_args_conditional_flags() {
        let opts = CheckpointOptions {
            work_path: Some(PathBuf::from("/tmp/work")),
            previous_image_path: Some(PathBuf::from("/tmp/cp/web.0")),
            leave_running: true,
            tcp_established: true,
            ext_unix_sk: true,
            shell_job: true,
            file_locks: true,
            ..checkpoint_opts()
        };
        let args = dump_args(Path::new("/rootfs"), 1, &opts, &[]);
        for flag in [
            "--tcp-established",
            "--ext-unix-sk",
            "--shell-job",
            "--file-locks",
            "--leave-running",
        ] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        let prev_at = args.iter().position(|a| a == "--prev-images-dir").unwrap();
        assert_eq!(args[prev_at + 1], "/tmp/cp/web.0");
        let work_at = args.iter().position(|a| a == "-W").unwrap();
        assert_eq!(args[work_at + 1], "/tmp/work");
    }

    #[test]
    fn test_dump_args_ext_mount_direction() {
        let args = dump_args(Path::new("/rootfs"), 1, &checkpoint_opts(), &mounts());
        // On dump every external mount maps its destination onto itself.
        assert!(args.contains(&"/data:/data".to_string()));
        assert!(args.contains(&"/etc/hosts:/etc/hosts".to_string()));
        assert_eq!(
            args.iter().filter(|a| *a == "--ext-mount-map").count(),
            2
        );
    }

    #[test]
    fn test_restore_args_fixed_tokens() {
        let args = restore_args(Path::new("/rootfs"), &restore_opts(), &[], None);
        let expected: Vec<String> = [
            "restore",
            "-d",
            "-v4",
            "-D",
            "/tmp/cp/web",
            "-o",
            "restore.log",
            "--pidfile",
            "restore.pid",
            "--root",
            "/rootfs",
            "--manage-cgroups",
            "--evasive-devices",
        ]
        .map(String::from)
        .to_vec();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_restore_args_ext_mount_direction_inverted() {
        let args = restore_args(Path::new("/rootfs"), &restore_opts(), &mounts(), None);
        // On restore the destination maps to the real host source.
        assert!(args.contains(&"/data:/var/lib/capstan/volumes/data".to_string()));
        assert!(args.contains(&"/etc/hosts:/var/lib/capstan/containers/web/hosts".to_string()));
    }

    #[test]
    fn test_restore_args_veth_pairs() {
        let mut opts = restore_opts();
        opts.veth_pairs = vec![
            VethPeerPlan {
                container_iface: "eth0".to_string(),
                host_peer: "veth0123456789abcd".to_string(),
                bridge: "capstan0".to_string(),
            },
            VethPeerPlan {
                container_iface: "eth1".to_string(),
                host_peer: "vethfedcba98765432".to_string(),
                bridge: "capstan0".to_string(),
            },
        ];
        let args = restore_args(Path::new("/rootfs"), &opts, &[], None);
        assert_eq!(
            args.iter().filter(|a| *a == "--veth-pair").count(),
            opts.veth_pairs.len()
        );
        assert!(args.contains(&"eth0=veth0123456789abcd@capstan0".to_string()));
        assert!(args.contains(&"eth1=vethfedcba98765432@capstan0".to_string()));
    }

    #[test]
    fn test_restore_args_inherit_fd_only_for_pipes() {
        let descriptors = [
            "/dev/pts/0".to_string(),
            "pipe:[111]".to_string(),
            "pipe:[222]".to_string(),
        ];
        let args = restore_args(Path::new("/rootfs"), &restore_opts(), &[], Some(&descriptors));
        assert!(!args.iter().any(|a| a.contains("fd[0]")));
        assert!(args.contains(&"fd[1]:pipe:[111]".to_string()));
        assert!(args.contains(&"fd[2]:pipe:[222]".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--inherit-fd").count(), 2);
    }

    #[test]
    fn test_checkpoint_and_restore_mount_maps_match() {
        // For every D:S mapping emitted on restore there is a matching D:D
        // mapping on the preceding checkpoint.
        let mounts = mounts();
        let dump = dump_args(Path::new("/rootfs"), 1, &checkpoint_opts(), &mounts);
        let restore = restore_args(Path::new("/rootfs"), &restore_opts(), &mounts, None);

        for mount in &mounts {
            let dest = mount.destination.display();
            assert!(restore.contains(&format!("{dest}:{}", mount.source.display())));
            assert!(dump.contains(&format!("{dest}:{dest}")));
        }
    }

    #[test]
    fn test_search_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = dir.path().join("criu");
        std::fs::write(&tool, "#!/bin/sh\n")?;

        let path_var = std::env::join_paths([PathBuf::from("/nonexistent"), dir.path().to_path_buf()])?;
        assert_eq!(search_path(&path_var, "criu"), Some(tool));
        assert_eq!(search_path(&path_var, "missing-tool"), None);

        Ok(())
    }

    #[test]
    fn test_remove_stale_pid_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Removing a pid file that does not exist is fine.
        remove_stale_pid_file(dir.path())?;

        std::fs::write(dir.path().join(PID_FILE), "99")?;
        remove_stale_pid_file(dir.path())?;
        assert!(!dir.path().join(PID_FILE).exists());

        Ok(())
    }

    #[test]
    fn test_log_tail_truncates() {
        let long = vec![b'x'; LOG_TAIL_BYTES * 2];
        assert_eq!(log_tail(&long).len(), LOG_TAIL_BYTES);
        assert_eq!(log_tail(b"short"), "short");
    }
}
