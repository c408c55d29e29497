//! Control plane assembly.
//!
//! Wires the registries, the snapshot builder, and the discovery service
//! together and serves them on one gRPC listener.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::config::Config;
use crate::proto::node::v1::node_registry_service_server::NodeRegistryServiceServer;
use crate::proto::service::v1::service_registry_service_server::ServiceRegistryServiceServer;
use crate::proto::xds::v1::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use crate::registry::{NodeRegistry, RegistryState, ServiceRegistry};
use crate::xds::{AggregatedDiscovery, SnapshotBuilder, SnapshotCache};

/// Binds the configured gRPC port and serves the control plane until the
/// shutdown future resolves.
pub async fn run(cfg: Config, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", cfg.grpc_port)).await?;

    run_with_listener(cfg, listener, shutdown).await
}

/// Serves the control plane on an already bound listener.
pub async fn run_with_listener(
    cfg: Config,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    info!(
        "Starting CARISMA control plane on {}",
        listener.local_addr()?
    );

    let state = Arc::new(RwLock::new(RegistryState::default()));
    let cache = Arc::new(SnapshotCache::new());

    let (tx_nodes, rx_nodes) = mpsc::channel(1);
    let (tx_services, rx_services) = mpsc::channel(1);

    let builder = Arc::new(SnapshotBuilder::new(
        cfg,
        Arc::clone(&state),
        Arc::clone(&cache),
    ));
    builder.spawn_consumers(rx_nodes, rx_services);

    let node_registry = NodeRegistry::new(Arc::clone(&state), tx_nodes);
    let service_registry = ServiceRegistry::new(state, tx_services);
    let discovery = AggregatedDiscovery::new(cache);

    Server::builder()
        .add_service(NodeRegistryServiceServer::new(node_registry))
        .add_service(ServiceRegistryServiceServer::new(service_registry))
        .add_service(AggregatedDiscoveryServiceServer::new(discovery))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    info!("Shutting down CARISMA control plane");

    Ok(())
}
