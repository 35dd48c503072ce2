//! Planning of veth endpoint reattachment for restored containers.
//!
//! The planner only allocates names: the snapshot tool re-creates the veth
//! pair itself from the `--veth-pair` mapping it is handed, so nothing here
//! talks to the kernel beyond checking for name collisions.

mod veth;

use serde::{Deserialize, Serialize};

pub use veth::{
    generate_peer_name, plan_reattachment, plan_reattachment_with, InterfaceLookup, SysfsLookup,
    VethPeerPlan,
};

/// Bridge every restored veth peer is attached to unless the daemon was
/// configured otherwise.
pub const DEFAULT_BRIDGE: &str = "capstan0";

/// Interface name assumed inside the container when the configuration does
/// not carry one. Containers that rename their interface away from this are
/// unsupported.
pub const DEFAULT_CONTAINER_IFACE: &str = "eth0";

/// Prefix for generated host-side peer names.
pub const VETH_PEER_PREFIX: &str = "veth";

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("could not generate a free interface name with prefix {prefix:?}")]
    NameExhausted { prefix: String },
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// A single network endpoint of a container, as recorded in its state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Endpoint driver; only `veth` endpoints participate in reattachment.
    pub driver: String,
    /// Container-side interface name. Falls back to
    /// [`DEFAULT_CONTAINER_IFACE`] when empty.
    #[serde(default)]
    pub interface: String,
    /// Prefix for the generated host-side peer name. Falls back to
    /// [`VETH_PEER_PREFIX`] when empty.
    #[serde(default)]
    pub peer_prefix: String,
}

impl NetworkConfig {
    pub fn veth(interface: &str) -> Self {
        Self {
            driver: "veth".to_string(),
            interface: interface.to_string(),
            peer_prefix: String::new(),
        }
    }

    pub fn is_veth(&self) -> bool {
        self.driver == "veth"
    }
}
