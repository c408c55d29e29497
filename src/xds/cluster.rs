//! Cluster and endpoint compilation.

use std::collections::HashSet;

use anyhow::{bail, Result};
use log::debug;

use crate::proto::xds::v1::{
    cluster, Cluster, ClusterLoadAssignment, Endpoint, SocketAddress,
};
use crate::registry::{get_node_idx, NodeAddr, ServiceConfigSnapshot};

// Upstream connect timeout shared by every generated cluster.
const CLUSTER_CONNECT_TIMEOUT_MS: u64 = 1_000;

pub(crate) fn generate_cluster_name(bundle_id: &str, is_local: bool) -> String {
    if is_local {
        format!("local_{}_cluster", bundle_id)
    } else {
        format!("{}_cluster", bundle_id)
    }
}

fn make_endpoints(
    nodes: &[NodeAddr],
    node_id: &str,
    bundle_id: &str,
    ports: &[i32],
) -> Result<Vec<Endpoint>> {
    let node_idx = get_node_idx(node_id)?;
    if node_idx >= nodes.len() {
        bail!("invalid node ID {}", node_id);
    }

    let node_address = &nodes[node_idx].host;

    let mut endpoints = Vec::with_capacity(ports.len());
    for port in ports {
        debug!(
            "Registering service endpoint {}:{} for bundle {} on {}",
            node_address, port, bundle_id, node_id
        );

        endpoints.push(Endpoint {
            socket_address: Some(SocketAddress {
                address: node_address.clone(),
                port_value: *port as u32,
            }),
        });
    }

    Ok(endpoints)
}

/// Compiles the cluster set for one target node. Every `(owner, bundle)`
/// service record contributes a cluster; local bundles expose their
/// announced ports, remote ones a single endpoint at the remote sidecar's
/// ingress port. The first occurrence of a cluster name wins.
pub(crate) fn make_clusters(
    nodes: &[NodeAddr],
    services: &ServiceConfigSnapshot,
    local_node_id: &str,
    ingress_port: u16,
) -> Result<Vec<Cluster>> {
    let mut clusters = Vec::new();
    let mut seen = HashSet::new();

    for (node_id, service_config) in services {
        for (bundle_id, instances) in service_config {
            let is_local = node_id == local_node_id;
            let cluster_id = generate_cluster_name(bundle_id, is_local);
            let ports = if is_local {
                instances.clone()
            } else {
                vec![ingress_port as i32]
            };

            if !seen.insert(cluster_id.clone()) {
                continue;
            }

            debug!("Registering cluster {}", cluster_id);

            let endpoints = make_endpoints(nodes, node_id, bundle_id, &ports)?;

            clusters.push(Cluster {
                name: cluster_id.clone(),
                r#type: cluster::DiscoveryType::StrictDns as i32,
                lb_policy: cluster::LbPolicy::RoundRobin as i32,
                dns_lookup_family: cluster::DnsLookupFamily::V4Only as i32,
                connect_timeout_ms: CLUSTER_CONNECT_TIMEOUT_MS,
                http2_protocol_options: true,
                load_assignment: Some(ClusterLoadAssignment {
                    cluster_name: cluster_id,
                    endpoints,
                }),
            });
        }
    }

    Ok(clusters)
}
