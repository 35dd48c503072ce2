//! Boundary to the layer storage that stages the container root filesystem.
//! The engine only needs a mount/unmount capability here; everything else
//! about graph drivers lives outside this crate.

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("failed to mount rootfs {path:?}")]
    Mount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to unmount rootfs {path:?}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

type Result<T> = std::result::Result<T, RootfsError>;

pub trait RootfsDriver: Send + Sync {
    fn mount(&self, rootfs: &Path) -> Result<()>;
    fn unmount(&self, rootfs: &Path) -> Result<()>;
}

/// Default driver: recursively bind-mounts the staged rootfs onto itself.
/// The snapshot tool requires its `--root` to be a mount point whose parent
/// is not overmounted; a self bind satisfies that without involving the
/// graph driver.
pub struct BindRootfs;

impl RootfsDriver for BindRootfs {
    fn mount(&self, rootfs: &Path) -> Result<()> {
        mount(
            Some(rootfs),
            rootfs,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|err| {
            tracing::error!(?rootfs, ?err, "failed to bind mount rootfs");
            RootfsError::Mount {
                path: rootfs.to_path_buf(),
                source: err,
            }
        })
    }

    fn unmount(&self, rootfs: &Path) -> Result<()> {
        umount2(rootfs, MntFlags::MNT_DETACH).map_err(|err| {
            tracing::error!(?rootfs, ?err, "failed to unmount rootfs");
            RootfsError::Unmount {
                path: rootfs.to_path_buf(),
                source: err,
            }
        })
    }
}
