//! Discovery snapshot builder.
//!
//! Translates the joint `(nodes, services)` registry state into a
//! versioned routing program per node and publishes it to the sidecar
//! snapshot cache. Two consumer tasks drive regeneration: one for new
//! nodes, one for refreshed service snapshots. Each arrival holds the
//! shared registry write lock across the whole regeneration, so every
//! published snapshot reflects one consistent registry view and versions
//! never interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::registry::{
    node_id_for_idx, NodeAddr, RegistryState, ServiceConfigSnapshot, SharedRegistry,
};

pub mod ads;
pub mod cache;
mod cluster;
mod resource;

pub use ads::AggregatedDiscovery;
pub use cache::{Snapshot, SnapshotCache};

pub struct SnapshotBuilder {
    cfg: Config,
    state: SharedRegistry,
    cache: Arc<SnapshotCache>,
    version: AtomicU64,
}

impl SnapshotBuilder {
    pub fn new(cfg: Config, state: SharedRegistry, cache: Arc<SnapshotCache>) -> Self {
        Self {
            cfg,
            state,
            cache,
            version: AtomicU64::new(0),
        }
    }

    /// Spawns the two consumer tasks serialising snapshot regeneration.
    /// A task ends on the first build error, halting further snapshot
    /// production while leaving programmed sidecars untouched.
    pub fn spawn_consumers(
        self: Arc<Self>,
        mut rx_nodes: mpsc::Receiver<NodeAddr>,
        mut rx_services: mpsc::Receiver<ServiceConfigSnapshot>,
    ) {
        let builder = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(addr) = rx_nodes.recv().await {
                debug!("Node change: {}", addr);

                let state = builder.state.write().await;
                if let Err(e) = builder.regenerate_all(&state) {
                    error!("Snapshot generation halted: {:#}", e);
                    return;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(snapshot) = rx_services.recv().await {
                debug!("Service change covering {} node(s)", snapshot.len());

                let state = self.state.write().await;
                if let Err(e) = self.regenerate_all(&state) {
                    error!("Snapshot generation halted: {:#}", e);
                    return;
                }
            }
        });
    }

    /// Rebuilds and publishes the snapshot of every known node under one
    /// fresh version.
    fn regenerate_all(&self, state: &RegistryState) -> Result<()> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let version_info = format!("{}.0", version);

        for idx in 0..state.nodes.len() {
            let node_id = node_id_for_idx(idx);

            debug!("Generating snapshot {} for {}", version_info, node_id);

            let snapshot = Snapshot {
                version: version_info.clone(),
                clusters: cluster::make_clusters(
                    &state.nodes,
                    &state.services,
                    &node_id,
                    self.cfg.ingress_port,
                )?,
                routes: resource::make_routes(&state.services, &node_id),
                listeners: resource::make_listeners(&self.cfg),
            };

            // snapshot publication is a core invariant; failing to set one
            // is unrecoverable
            if let Err(e) = self.cache.set_snapshot(&node_id, snapshot) {
                panic!("cannot publish snapshot for {}: {}", node_id, e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::xds::v1::{listener, Cluster, RouteConfiguration};
    use tokio::sync::RwLock;

    fn test_config() -> Config {
        Config {
            ingress_port: 8000,
            egress_port: 9000,
            ..Config::default()
        }
    }

    fn node(host: &str) -> NodeAddr {
        NodeAddr {
            host: host.into(),
            port: 8000,
        }
    }

    fn builder_with(state: RegistryState) -> (Arc<SnapshotBuilder>, Arc<SnapshotCache>) {
        let cache = Arc::new(SnapshotCache::new());
        let builder = Arc::new(SnapshotBuilder::new(
            test_config(),
            Arc::new(RwLock::new(state)),
            Arc::clone(&cache),
        ));

        (builder, cache)
    }

    async fn regenerate(builder: &SnapshotBuilder) {
        let state = builder.state.write().await;
        builder.regenerate_all(&state).expect("regenerate");
    }

    fn cluster_names(clusters: &[Cluster]) -> Vec<&str> {
        clusters.iter().map(|c| c.name.as_str()).collect()
    }

    fn route_table<'a>(routes: &'a [RouteConfiguration], name: &str) -> &'a RouteConfiguration {
        routes.iter().find(|r| r.name == name).expect("route table")
    }

    #[tokio::test]
    async fn lone_node_receives_an_empty_snapshot() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));

        let (builder, cache) = builder_with(state);
        regenerate(&builder).await;

        let snapshot = cache.get_snapshot("node-0").expect("snapshot");
        assert_eq!(snapshot.version, "1.0");
        assert!(snapshot.clusters.is_empty());

        assert_eq!(snapshot.listeners.len(), 2);
        let ingress = &snapshot.listeners[0];
        assert_eq!(ingress.address.as_ref().unwrap().port_value, 8000);
        assert_eq!(
            ingress.traffic_direction,
            listener::TrafficDirection::Inbound as i32
        );
        let egress = &snapshot.listeners[1];
        assert_eq!(egress.address.as_ref().unwrap().port_value, 9000);
        assert_eq!(
            egress.traffic_direction,
            listener::TrafficDirection::Outbound as i32
        );

        for table in &snapshot.routes {
            assert!(table.virtual_hosts[0].routes.is_empty());
        }
    }

    #[tokio::test]
    async fn service_clusters_and_routes_per_node() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));
        state.nodes.push(node("10.0.0.2"));
        state.register_service("node-1", "com.x.app", 8080);

        let (builder, cache) = builder_with(state);
        regenerate(&builder).await;

        // the remote view: traffic traverses the owner's sidecar ingress
        let snapshot = cache.get_snapshot("node-0").expect("snapshot");
        assert_eq!(cluster_names(&snapshot.clusters), vec!["com.x.app_cluster"]);
        let endpoint = snapshot.clusters[0].load_assignment.as_ref().unwrap().endpoints[0]
            .socket_address
            .as_ref()
            .unwrap();
        assert_eq!(endpoint.address, "10.0.0.2");
        assert_eq!(endpoint.port_value, 8000);

        let egress = route_table(&snapshot.routes, "grpc_route");
        assert_eq!(
            egress.virtual_hosts[0].routes[0].r#match.as_ref().unwrap().prefix,
            "/com.x.app"
        );
        let ingress = route_table(&snapshot.routes, "local_grpc_route");
        assert!(ingress.virtual_hosts[0].routes.is_empty());

        // the owner's view: a local cluster at the announced port
        let snapshot = cache.get_snapshot("node-1").expect("snapshot");
        assert_eq!(
            cluster_names(&snapshot.clusters),
            vec!["local_com.x.app_cluster"]
        );
        let endpoint = snapshot.clusters[0].load_assignment.as_ref().unwrap().endpoints[0]
            .socket_address
            .as_ref()
            .unwrap();
        assert_eq!(endpoint.address, "10.0.0.2");
        assert_eq!(endpoint.port_value, 8080);

        for table_name in ["grpc_route", "local_grpc_route"] {
            let table = route_table(&snapshot.routes, table_name);
            assert_eq!(
                table.virtual_hosts[0].routes[0].r#match.as_ref().unwrap().prefix,
                "/com.x.app"
            );
            assert_eq!(
                table.virtual_hosts[0].routes[0].cluster,
                "local_com.x.app_cluster"
            );
        }
    }

    #[tokio::test]
    async fn versions_strictly_increase_per_regeneration() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));

        let (builder, cache) = builder_with(state);

        regenerate(&builder).await;
        assert_eq!(cache.get_snapshot("node-0").unwrap().version, "1.0");

        regenerate(&builder).await;
        regenerate(&builder).await;
        assert_eq!(cache.get_snapshot("node-0").unwrap().version, "3.0");
    }

    #[tokio::test]
    async fn unregistering_to_empty_drops_cluster_and_route() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));
        state.nodes.push(node("10.0.0.2"));
        state.register_service("node-1", "com.x.app", 8080);
        state.unregister_service("node-1", "com.x.app", 8080);

        let (builder, cache) = builder_with(state);
        regenerate(&builder).await;

        for node_id in ["node-0", "node-1"] {
            let snapshot = cache.get_snapshot(node_id).expect("snapshot");
            assert!(snapshot.clusters.is_empty());
            for table in &snapshot.routes {
                assert!(table.virtual_hosts[0].routes.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn cluster_names_are_unique_and_routes_resolve() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));
        state.nodes.push(node("10.0.0.2"));
        state.nodes.push(node("10.0.0.3"));
        // the same bundle on two remote nodes plus a second bundle
        state.register_service("node-0", "com.a", 8081);
        state.register_service("node-1", "com.a", 8082);
        state.register_service("node-1", "com.b", 9090);

        let (builder, cache) = builder_with(state);
        regenerate(&builder).await;

        let snapshot = cache.get_snapshot("node-2").expect("snapshot");

        let names = cluster_names(&snapshot.clusters);
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names, deduped);
        assert_eq!(names, vec!["com.a_cluster", "com.b_cluster"]);

        // first occurrence wins: com.a_cluster points at node-0
        let endpoint = snapshot.clusters[0].load_assignment.as_ref().unwrap().endpoints[0]
            .socket_address
            .as_ref()
            .unwrap();
        assert_eq!(endpoint.address, "10.0.0.1");

        for table in &snapshot.routes {
            for route in &table.virtual_hosts[0].routes {
                assert!(
                    names.contains(&route.cluster.as_str()),
                    "route {} references unknown cluster {}",
                    route.r#match.as_ref().unwrap().prefix,
                    route.cluster
                );
            }
        }
    }

    #[tokio::test]
    async fn remote_routes_precede_local_ones() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));
        state.nodes.push(node("10.0.0.2"));
        state.register_service("node-0", "com.remote", 8081);
        state.register_service("node-1", "com.local", 8082);

        let (builder, cache) = builder_with(state);
        regenerate(&builder).await;

        let snapshot = cache.get_snapshot("node-1").expect("snapshot");
        let egress = route_table(&snapshot.routes, "grpc_route");
        let prefixes: Vec<_> = egress.virtual_hosts[0]
            .routes
            .iter()
            .map(|r| r.r#match.as_ref().unwrap().prefix.as_str())
            .collect();

        assert_eq!(prefixes, vec!["/com.remote", "/com.local"]);
    }

    #[tokio::test]
    async fn unknown_service_owner_fails_the_build() {
        let mut state = RegistryState::default();
        state.nodes.push(node("10.0.0.1"));
        state.register_service("node-7", "com.x.app", 8080);

        let (builder, _cache) = builder_with(state);

        let state = builder.state.write().await;
        assert!(builder.regenerate_all(&state).is_err());
    }

    #[tokio::test]
    async fn consumer_tasks_drive_regeneration() {
        let (builder, cache) = builder_with(RegistryState::default());

        let (tx_nodes, rx_nodes) = mpsc::channel(1);
        let (tx_services, rx_services) = mpsc::channel(1);
        Arc::clone(&builder).spawn_consumers(rx_nodes, rx_services);

        let mut updates = cache.subscribe("node-0").expect("subscribe");

        // a node arrival mirrors what the node registry does: mutate
        // first, then notify
        {
            let mut state = builder.state.write().await;
            state.nodes.push(node("10.0.0.1"));
        }
        tx_nodes.send(node("10.0.0.1")).await.expect("send");

        updates.changed().await.expect("snapshot");
        assert_eq!(
            updates.borrow_and_update().as_ref().unwrap().version,
            "1.0"
        );

        // a service refresh regenerates again under the next version
        let snapshot = {
            let mut state = builder.state.write().await;
            state.register_service("node-0", "com.x.app", 8080);
            state.services.clone()
        };
        tx_services.send(snapshot).await.expect("send");

        updates.changed().await.expect("snapshot");
        assert_eq!(
            updates.borrow_and_update().as_ref().unwrap().version,
            "2.0"
        );
    }
}
