//! Captures the pieces of container state the snapshot tool destroys or
//! cannot reproduce on its own: the resolved targets of the three standard
//! descriptors, and the pid of the restored init process.

use std::fs::{read_link, File};
use std::io::{self, Write};
use std::path::Path;

/// Sidecar file inside the image directory holding the resolved stdio
/// targets at the time of the dump.
pub const DESCRIPTORS_FILE: &str = "descriptors.json";

/// Prefix of a resolved descriptor target that refers to an anonymous pipe
/// (`pipe:[<inode>]`). Pipes set up for stdio are gone after a checkpoint,
/// so these are the targets the snapshot tool must inherit on restore.
pub const PIPE_LINK_PREFIX: &str = "pipe:";

/// Resolves the targets of file descriptors 0, 1 and 2 of the given process.
/// Fails on the first unreadable link.
pub fn read_std_descriptors(pid: i32) -> io::Result<[String; 3]> {
    let mut targets: [String; 3] = Default::default();
    for (n, target) in targets.iter_mut().enumerate() {
        let link = read_link(format!("/proc/{pid}/fd/{n}"))?;
        *target = link.to_string_lossy().into_owned();
    }

    Ok(targets)
}

/// Like [`read_std_descriptors`], but substitutes `/dev/null` for any
/// descriptor that cannot be resolved. Used at checkpoint time, where a
/// container may legitimately run with closed stdio.
pub fn snapshot_std_descriptors(pid: i32) -> [String; 3] {
    let mut targets: [String; 3] = Default::default();
    for (n, target) in targets.iter_mut().enumerate() {
        *target = match read_link(format!("/proc/{pid}/fd/{n}")) {
            Ok(link) => link.to_string_lossy().into_owned(),
            Err(..) => "/dev/null".to_string(),
        };
    }

    targets
}

pub fn write_descriptors_file(image_dir: &Path, targets: &[String; 3]) -> io::Result<()> {
    let path = image_dir.join(DESCRIPTORS_FILE);
    let mut file = File::create(&path)?;
    let json = serde_json::to_string(&targets.to_vec())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write!(file, "{json}")?;

    Ok(())
}

pub fn load_descriptors_file(image_dir: &Path) -> io::Result<[String; 3]> {
    let path = image_dir.join(DESCRIPTORS_FILE);
    let data = std::fs::read_to_string(&path)?;
    let targets: Vec<String> = serde_json::from_str(&data)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    targets.try_into().map_err(|targets: Vec<String>| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected 3 descriptor targets, found {}", targets.len()),
        )
    })
}

/// Reads the pid the snapshot tool wrote after a restore: a plain ASCII
/// decimal integer, trailing whitespace optional.
pub fn read_restore_pid(pid_file: &Path) -> io::Result<i32> {
    let data = std::fs::read_to_string(pid_file)?;
    data.trim().parse::<i32>().map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cannot parse pid from {pid_file:?}: {err}"),
        )
    })
}
