pub mod checkpoint;
pub mod restore;

use anyhow::{bail, Result};
use libcapstan::daemon::Daemon;

/// Runs one operation per named container. Per-container failures go to the
/// diagnostic stream and do not abort the batch; the first failure makes the
/// whole invocation fail once every container has been attempted.
pub(crate) fn for_each_container<F>(
    daemon: &Daemon,
    containers: &[String],
    what: &str,
    mut op: F,
) -> Result<()>
where
    F: FnMut(&Daemon, &str) -> std::result::Result<(), libcapstan::EngineError>,
{
    let mut encountered_error = false;
    for name in containers {
        match op(daemon, name) {
            Ok(()) => println!("{name}"),
            Err(err) => {
                eprintln!("{name}: {err}");
                encountered_error = true;
            }
        }
    }

    if encountered_error {
        bail!("failed to {what} one or more containers");
    }

    Ok(())
}
