use std::fmt::Write as _;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{NetworkConfig, NetworkError, DEFAULT_CONTAINER_IFACE, VETH_PEER_PREFIX};

/// Number of hex characters appended to the peer-name prefix.
const PEER_NAME_HEX_LEN: usize = 14;

/// How often name generation retries before giving up. Collisions are
/// essentially impossible with 56 random bits, so hitting this limit means
/// something is wrong with the lookup, not with the generator.
const GENERATE_ATTEMPTS: usize = 3;

/// Reattachment plan for one container interface: the snapshot tool
/// re-creates the veth pair under these names and moves the host side onto
/// the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VethPeerPlan {
    pub container_iface: String,
    pub host_peer: String,
    pub bridge: String,
}

impl VethPeerPlan {
    /// Renders the plan in the `IN=OUT@BRIDGE` form the snapshot tool takes
    /// for its `--veth-pair` option.
    pub fn pair_spec(&self) -> String {
        format!("{}={}@{}", self.container_iface, self.host_peer, self.bridge)
    }
}

/// Answers whether an interface name is already taken on the host. Split out
/// as a trait so the planner can be exercised without live interfaces.
pub trait InterfaceLookup {
    fn exists(&self, name: &str) -> bool;
}

/// Looks interfaces up through sysfs.
pub struct SysfsLookup;

impl InterfaceLookup for SysfsLookup {
    fn exists(&self, name: &str) -> bool {
        Path::new("/sys/class/net").join(name).exists()
    }
}

/// Generates a fresh host-side peer name: the prefix followed by 14 hex
/// characters from a cryptographically strong source. Retries while the
/// generated name collides with a live interface.
pub fn generate_peer_name(
    prefix: &str,
    lookup: &dyn InterfaceLookup,
) -> Result<String, NetworkError> {
    for _ in 0..GENERATE_ATTEMPTS {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        let mut name = String::with_capacity(prefix.len() + PEER_NAME_HEX_LEN);
        name.push_str(prefix);
        for byte in id {
            let _ = write!(name, "{byte:02x}");
            if name.len() >= prefix.len() + PEER_NAME_HEX_LEN {
                break;
            }
        }
        name.truncate(prefix.len() + PEER_NAME_HEX_LEN);

        if !lookup.exists(&name) {
            return Ok(name);
        }
    }

    Err(NetworkError::NameExhausted {
        prefix: prefix.to_string(),
    })
}

/// Computes the reattachment plan for every veth endpoint of a container.
/// Non-veth endpoints get no plan. The container-side interface name falls
/// back to `eth0` when the configuration does not carry one.
pub fn plan_reattachment_with(
    networks: &[NetworkConfig],
    bridge: &str,
    lookup: &dyn InterfaceLookup,
) -> Result<Vec<VethPeerPlan>, NetworkError> {
    let mut plans = Vec::new();
    for network in networks.iter().filter(|n| n.is_veth()) {
        let prefix = match network.peer_prefix.as_str() {
            "" => VETH_PEER_PREFIX,
            prefix => prefix,
        };
        let container_iface = match network.interface.as_str() {
            "" => DEFAULT_CONTAINER_IFACE,
            name => name,
        };
        let host_peer = generate_peer_name(prefix, lookup)?;
        let plan = VethPeerPlan {
            container_iface: container_iface.to_string(),
            host_peer,
            bridge: bridge.to_string(),
        };
        tracing::debug!(pair = %plan.pair_spec(), "planned veth reattachment");
        plans.push(plan);
    }

    Ok(plans)
}

pub fn plan_reattachment(
    networks: &[NetworkConfig],
    bridge: &str,
) -> Result<Vec<VethPeerPlan>, NetworkError> {
    plan_reattachment_with(networks, bridge, &SysfsLookup)
}
