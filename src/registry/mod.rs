//! Node and service registries.
//!
//! The registries share one `(nodes, services)` state pair behind a single
//! readers-writer lock, which the discovery snapshot builder also holds
//! across snapshot regeneration. Node identities are dense integer indices
//! into the address list, rendered as `node-<i>`; they are allocated
//! monotonically and never reused within a process lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tonic::metadata::MetadataMap;
use tonic::Status;

pub mod node;
pub mod service;

pub use node::NodeRegistry;
pub use service::ServiceRegistry;

/// Metadata key every channel-opening request must carry.
pub const HEADER_NODE_ID: &str = "x-carisma-node-id";

/// Hostname and ingress port of a registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Mapping of services to nodes at one point in time:
/// `node-ID → (bundle-ID → local ports)`.
pub type ServiceConfigSnapshot = BTreeMap<String, BTreeMap<String, Vec<i32>>>;

/// The joint registry state guarded by the shared lock.
#[derive(Debug, Default)]
pub struct RegistryState {
    pub nodes: Vec<NodeAddr>,
    pub services: ServiceConfigSnapshot,
}

/// The shared registry handle.
pub type SharedRegistry = Arc<RwLock<RegistryState>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing CARISMA node ID header")]
    MissingHeader,
    #[error("invalid node ID")]
    InvalidNodeId,
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        Status::failed_precondition(err.to_string())
    }
}

/// Renders the node identity for an index.
pub fn node_id_for_idx(idx: usize) -> String {
    format!("node-{}", idx)
}

/// Extracts the node's index out of a node ID.
pub fn get_node_idx(node_id: &str) -> Result<usize, RegistryError> {
    node_id
        .rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .ok_or(RegistryError::InvalidNodeId)
}

/// Reads the node ID header out of request metadata.
pub fn node_id_from_metadata(metadata: &MetadataMap) -> Result<String, RegistryError> {
    let value = metadata
        .get(HEADER_NODE_ID)
        .ok_or(RegistryError::MissingHeader)?;

    value
        .to_str()
        .map(str::to_string)
        .map_err(|_| RegistryError::MissingHeader)
}

impl RegistryState {
    /// Checks whether the node with the provided ID has been registered
    /// and returns its index.
    pub fn validate_node_id(&self, node_id: &str) -> Result<usize, RegistryError> {
        let idx = get_node_idx(node_id)?;

        if idx >= self.nodes.len() {
            return Err(RegistryError::InvalidNodeId);
        }

        Ok(idx)
    }

    /// Records a service instance for a node. Port lists stay sorted and
    /// duplicate free.
    pub fn register_service(&mut self, node_id: &str, bundle_id: &str, port: i32) {
        let ports = self
            .services
            .entry(node_id.to_string())
            .or_default()
            .entry(bundle_id.to_string())
            .or_default();

        ports.push(port);
        ports.sort_unstable();
        ports.dedup();
    }

    /// Removes a service instance. Bundles whose port list empties are
    /// dropped entirely; unknown ports are a no-op.
    pub fn unregister_service(&mut self, node_id: &str, bundle_id: &str, port: i32) {
        let Some(bundles) = self.services.get_mut(node_id) else {
            return;
        };
        let Some(ports) = bundles.get_mut(bundle_id) else {
            return;
        };

        ports.retain(|&p| p != port);

        if ports.is_empty() {
            bundles.remove(bundle_id);
        }
    }
}
