//! Service registry gRPC service.

use log::info;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::service::v1::service_announcement::RegistrationState;
use crate::proto::service::v1::service_registry_service_server::ServiceRegistryService;
use crate::proto::service::v1::{ChannelAck, ServiceAnnouncement};

use super::{node_id_from_metadata, ServiceConfigSnapshot, SharedRegistry};

/// Implements the service registry: per-node bundle/port bookkeeping with
/// a full snapshot published on every change.
pub struct ServiceRegistry {
    state: SharedRegistry,
    tx_services: mpsc::Sender<ServiceConfigSnapshot>,
}

impl ServiceRegistry {
    pub fn new(state: SharedRegistry, tx_services: mpsc::Sender<ServiceConfigSnapshot>) -> Self {
        Self { state, tx_services }
    }
}

#[tonic::async_trait]
impl ServiceRegistryService for ServiceRegistry {
    async fn open_channel(
        &self,
        request: Request<Streaming<ServiceAnnouncement>>,
    ) -> Result<Response<ChannelAck>, Status> {
        let node_id = node_id_from_metadata(request.metadata())?;

        {
            let state = self.state.read().await;
            state.validate_node_id(&node_id)?;
        }

        let mut inbound = request.into_inner();
        loop {
            let announcement = match inbound.message().await? {
                Some(announcement) => announcement,
                None => return Ok(Response::new(ChannelAck {})),
            };

            // The refreshed snapshot is cloned under the lock but sent
            // after releasing it; the consumer takes the same lock.
            let snapshot = {
                let mut state = self.state.write().await;

                if announcement.registration_state() == RegistrationState::Registered {
                    state.register_service(
                        &node_id,
                        &announcement.bundle_id,
                        announcement.local_port,
                    );
                    info!(
                        "Registered service {} port {} on {}",
                        announcement.bundle_id, announcement.local_port, node_id
                    );
                } else {
                    state.unregister_service(
                        &node_id,
                        &announcement.bundle_id,
                        announcement.local_port,
                    );
                    info!(
                        "Unregistered service {} port {} on {}",
                        announcement.bundle_id, announcement.local_port, node_id
                    );
                }

                state.services.clone()
            };

            let _ = self.tx_services.send(snapshot).await;
        }
    }
}
