//! Node registry gRPC service.

use std::pin::Pin;

use futures_util::Stream;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::broker::Broker;
use crate::deployment::{self, DeploymentConfig};
use crate::proto::node::v1::deployment_configuration::StateType;
use crate::proto::node::v1::node_registry_service_server::NodeRegistryService;
use crate::proto::node::v1::{DeploymentConfiguration, RegisterRequest, RegisterResponse};

use super::{node_id_from_metadata, node_id_for_idx, NodeAddr, SharedRegistry};

/// Implements the node registry: identity assignment and the broadcast
/// channel for deployment configurations.
pub struct NodeRegistry {
    state: SharedRegistry,
    broker: Broker<DeploymentConfiguration>,
    tx_nodes: mpsc::Sender<NodeAddr>,
}

impl NodeRegistry {
    pub fn new(state: SharedRegistry, tx_nodes: mpsc::Sender<NodeAddr>) -> Self {
        Self {
            state,
            broker: Broker::new(),
            tx_nodes,
        }
    }

    /// The broker fanning deployment configurations out to all open
    /// channels.
    pub fn broker(&self) -> Broker<DeploymentConfiguration> {
        self.broker.clone()
    }
}

// Publishes a synthetic single-host configuration as observed state.
async fn publish_actual_state(broker: &Broker<DeploymentConfiguration>, config: DeploymentConfig) {
    match deployment::to_json(&config) {
        Ok(json) => {
            broker
                .publish(DeploymentConfiguration {
                    json: String::from_utf8_lossy(&json).into_owned(),
                    state_type: StateType::Actual as i32,
                })
                .await;
        }
        Err(e) => error!("Could not serialize synthetic actual state: {}", e),
    }
}

#[tonic::async_trait]
impl NodeRegistryService for NodeRegistry {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let request = request.into_inner();
        let addr = NodeAddr {
            host: request.address,
            port: request.port as u16,
        };

        let new_idx = {
            let mut state = self.state.write().await;
            state.nodes.push(addr.clone());

            state.nodes.len() - 1
        };

        let _ = self.tx_nodes.send(addr.clone()).await;

        let node_id = node_id_for_idx(new_idx);
        debug!("Registering node {} at {}", node_id, addr);

        Ok(Response::new(RegisterResponse { id: node_id }))
    }

    type OpenChannelStream =
        Pin<Box<dyn Stream<Item = Result<DeploymentConfiguration, Status>> + Send>>;

    async fn open_channel(
        &self,
        request: Request<Streaming<DeploymentConfiguration>>,
    ) -> Result<Response<Self::OpenChannelStream>, Status> {
        let node_id = node_id_from_metadata(request.metadata())?;

        let hostname = {
            let state = self.state.read().await;
            let node_idx = state.validate_node_id(&node_id)?;

            state.nodes[node_idx].host.clone()
        };

        // Announce the arrival before subscribing, so the channel does not
        // see its own synthetic message.
        publish_actual_state(&self.broker, deployment::for_starting_node(&hostname)).await;
        let mut updates = self.broker.subscribe().await;

        let (tx_out, rx_out) = mpsc::channel(5);
        tokio::spawn(async move {
            while let Some(msg) = updates.recv().await {
                if tx_out.send(Ok(msg)).await.is_err() {
                    // peer is gone, the receive side handles the departure
                    break;
                }
            }
        });

        let broker = self.broker.clone();
        let mut inbound = request.into_inner();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(msg)) => broker.publish(msg).await,
                    Ok(None) => break,
                    Err(status) => {
                        debug!("Deployment channel of {} ended: {}", hostname, status);
                        break;
                    }
                }
            }

            publish_actual_state(&broker, deployment::for_stopped_node(&hostname)).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx_out))))
    }
}
