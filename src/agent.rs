//! Per-node agent.
//!
//! Runs on every node: registers with the control plane, starts the
//! sidecar, opens the deployment and service announcement channels, and
//! drives the reconciliation loop. On the central node it additionally
//! watches the desired state file and aggregates the actual state
//! reported by all satellites.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::aggregator::ActualStateAggregator;
use crate::config::Config;
use crate::deployment::{self, DeploymentConfig, NodeConfig, NodeState};
use crate::discovery;
use crate::orchestrator::{running_managed_containers, Orchestrator};
use crate::proto::node::v1::deployment_configuration::StateType;
use crate::proto::node::v1::node_registry_service_client::NodeRegistryServiceClient;
use crate::proto::node::v1::{DeploymentConfiguration, RegisterRequest};
use crate::proto::service::v1::service_registry_service_client::ServiceRegistryServiceClient;
use crate::registry::HEADER_NODE_ID;
use crate::runtime::image::extract_image_list;
use crate::runtime::{DockerManager, EmulatedManager, Manager};
use crate::sidecar;
use crate::watcher::FileWatcher;

/// Location of the file containing the desired deployment config.
pub const DESIRED_DEPLOYMENT_CONFIG_FILE_PATH: &str =
    "/opt/carisma/conf/global_desired_state.json";

/// Location of the file containing the actual deployment config.
pub const ACTUAL_DEPLOYMENT_CONFIG_FILE_PATH: &str =
    "/opt/carisma/conf/global_actual_state.json";

// Delay between the messages transmitting the actual state.
const REFRESH_RATE: Duration = Duration::from_secs(5);

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

async fn connect_with_retry(url: &str) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(url.to_string())?;

    loop {
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                warn!("Control plane at {} not reachable yet: {}", url, e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

fn channel_request<T>(stream: T, node_id: &str) -> Result<Request<T>> {
    let value: MetadataValue<Ascii> = node_id
        .parse()
        .map_err(|_| anyhow!("node ID {} is not valid metadata", node_id))?;

    let mut request = Request::new(stream);
    request.metadata_mut().insert(HEADER_NODE_ID, value);

    Ok(request)
}

// Packages the running managed containers into a single-host ACTUAL
// deployment configuration message.
async fn actual_state_message(
    manager: &Arc<dyn Manager>,
    cfg: &Config,
) -> Result<DeploymentConfiguration> {
    let current = running_managed_containers(manager.containers().await?);
    let images = extract_image_list(&current)
        .iter()
        .map(|image| format!("{}:{}", image.name, image.version))
        .collect();

    let mut config = DeploymentConfig::new();
    config.insert(
        cfg.node.clone(),
        NodeConfig {
            state: NodeState::Running,
            images,
        },
    );

    Ok(DeploymentConfiguration {
        json: String::from_utf8_lossy(&deployment::to_json(&config)?).into_owned(),
        state_type: StateType::Actual as i32,
    })
}

fn spawn_actual_state_reporter(
    manager: Arc<dyn Manager>,
    cfg: Config,
    tx: mpsc::Sender<DeploymentConfiguration>,
) {
    tokio::spawn(async move {
        let mut ticker = interval(REFRESH_RATE);
        ticker.tick().await; // the first tick fires immediately

        loop {
            ticker.tick().await;

            match actual_state_message(&manager, &cfg).await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("Could not assemble the actual state report: {:#}", e);
                    return;
                }
            }
        }
    });
}

/// Removes a possibly still running sidecar. Used on startup and as the
/// final cleanup step on shutdown.
pub async fn shutdown_cleanup(cfg: &Config) {
    if cfg.emulate_container_runtime {
        return;
    }

    match DockerManager::new().await {
        Ok(manager) => {
            if let Err(e) = sidecar::stop_sidecar(&manager, cfg).await {
                debug!("No sidecar to remove: {:#}", e);
            }
            let _ = manager.close().await;
        }
        Err(e) => debug!("Container engine unavailable during cleanup: {:#}", e),
    }
}

/// Runs the agent until its deployment channel closes.
pub async fn run(mut cfg: Config) -> Result<()> {
    let manager: Arc<dyn Manager> = if cfg.emulate_container_runtime {
        Arc::new(EmulatedManager::new())
    } else {
        Arc::new(DockerManager::new().await?)
    };

    // stop a potentially running sidecar instance from a previous life
    if let Err(e) = sidecar::stop_sidecar(manager.as_ref(), &cfg).await {
        debug!("No leftover sidecar to remove: {:#}", e);
    }

    if cfg.enable_discovery {
        discovery::handle_discovery(&mut cfg).await;
    }

    let url = format!("http://{}:{}", cfg.central_node, cfg.grpc_port);
    let channel = connect_with_retry(&url).await?;

    let mut node_client = NodeRegistryServiceClient::new(channel.clone());
    let node_id = node_client
        .register(RegisterRequest {
            address: cfg.node.clone(),
            port: cfg.ingress_port as i32,
        })
        .await?
        .into_inner()
        .id;

    info!("Received node ID {} during node registration", node_id);

    sidecar::run_sidecar(manager.as_ref(), &cfg, &node_id).await?;

    // service announcement channel; the call future runs until the
    // sender side is dropped
    let (tx_announcements, rx_announcements) = mpsc::channel(16);
    {
        let request = channel_request(ReceiverStream::new(rx_announcements), &node_id)?;
        let mut service_client = ServiceRegistryServiceClient::new(channel.clone());
        tokio::spawn(async move {
            if let Err(e) = service_client.open_channel(request).await {
                error!("Service announcement channel ended: {}", e);
            }
        });
    }

    // deployment configuration channel
    let (tx_deployments, rx_deployments) = mpsc::channel(16);
    let request = channel_request(ReceiverStream::new(rx_deployments), &node_id)?;
    let mut inbound = node_client.open_channel(request).await?.into_inner();

    let orchestrator = Arc::new(Orchestrator::new(
        cfg.clone(),
        Arc::clone(&manager),
        tx_announcements,
    ));

    spawn_actual_state_reporter(Arc::clone(&manager), cfg.clone(), tx_deployments.clone());

    if cfg.enable_central_mode {
        let watcher = FileWatcher::new(Path::new(DESIRED_DEPLOYMENT_CONFIG_FILE_PATH))?;
        let watcher_handle = watcher.handle();

        // on every content change: broadcast the new desired state and
        // reconcile locally (the central node is itself a satellite)
        let handler_tx = tx_deployments.clone();
        let handler_orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(watcher.watch(move |_previous, current| {
            let tx = handler_tx.clone();
            let orchestrator = Arc::clone(&handler_orchestrator);
            async move {
                let config = match deployment::from_json(&current) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Malformed desired state file: {}", e);
                        return;
                    }
                };

                let msg = DeploymentConfiguration {
                    json: String::from_utf8_lossy(&current).into_owned(),
                    state_type: StateType::Desired as i32,
                };
                if tx.send(msg).await.is_err() {
                    error!("Deployment channel is gone");
                }

                if let Err(e) = orchestrator.process(&config).await {
                    error!("Reconciliation failed: {:#}", e);
                }
            }
        }));

        // initially compare the system state to the desired state
        watcher_handle.diff(false).await;

        let mut aggregator = ActualStateAggregator::new(
            PathBuf::from(ACTUAL_DEPLOYMENT_CONFIG_FILE_PATH),
            watcher_handle,
        );

        loop {
            let msg = match inbound.message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!("Deployment channel ended: {}", e);
                    break;
                }
            };

            if msg.state_type() != StateType::Actual {
                continue;
            }

            match deployment::from_json(msg.json.as_bytes()) {
                Ok(report) => {
                    if let Err(e) = aggregator.handle(report).await {
                        error!("Could not persist the actual state: {:#}", e);
                    }
                }
                Err(e) => error!("Malformed actual state report: {}", e),
            }
        }
    } else {
        loop {
            let msg = match inbound.message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!("Deployment channel ended: {}", e);
                    break;
                }
            };

            if msg.state_type() != StateType::Desired {
                continue;
            }

            match deployment::from_json(msg.json.as_bytes()) {
                Ok(config) => {
                    if let Err(e) = orchestrator.process(&config).await {
                        error!("Reconciliation failed: {:#}", e);
                    }
                }
                Err(e) => error!("Malformed deployment configuration: {}", e),
            }
        }
    }

    if let Err(e) = sidecar::stop_sidecar(manager.as_ref(), &cfg).await {
        debug!("Could not remove the sidecar: {:#}", e);
    }
    manager.close().await?;

    Ok(())
}
