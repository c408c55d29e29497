//! Aggregated discovery gRPC service.
//!
//! Sidecars open one stream, name their node in the first request, and
//! receive the full routing snapshot as a single response whenever a new
//! version is published for them. Subsequent requests on the stream are
//! acknowledgements and are drained without further effect.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::xds::v1::aggregated_discovery_service_server::AggregatedDiscoveryService;
use crate::proto::xds::v1::{DiscoveryRequest, DiscoveryResponse};

use super::cache::SnapshotCache;

const AGGREGATED_TYPE_URL: &str = "carisma.xds.v1/aggregated";

pub struct AggregatedDiscovery {
    cache: Arc<SnapshotCache>,
}

impl AggregatedDiscovery {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AggregatedDiscovery {
    type StreamResourcesStream =
        Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

    async fn stream_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamResourcesStream>, Status> {
        let mut inbound = request.into_inner();
        let cache = Arc::clone(&self.cache);
        let (tx, rx) = mpsc::channel(5);

        tokio::spawn(async move {
            // the first request names the node
            let node_id = match inbound.message().await {
                Ok(Some(request)) => request.node_id,
                _ => return,
            };
            if node_id.is_empty() {
                let _ = tx
                    .send(Err(Status::invalid_argument(
                        "first discovery request names no node",
                    )))
                    .await;
                return;
            }

            debug!("Discovery stream opened for {}", node_id);

            let mut updates = match cache.subscribe(&node_id) {
                Ok(updates) => updates,
                Err(e) => {
                    let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                    return;
                }
            };

            // drain acknowledgements so the peer's sends never stall
            tokio::spawn(async move { while let Ok(Some(_)) = inbound.message().await {} });

            let mut nonce: u64 = 0;
            loop {
                let response = updates.borrow_and_update().as_ref().map(|snapshot| {
                    nonce += 1;
                    DiscoveryResponse {
                        version_info: snapshot.version.clone(),
                        type_url: AGGREGATED_TYPE_URL.into(),
                        clusters: snapshot.clusters.clone(),
                        routes: snapshot.routes.clone(),
                        listeners: snapshot.listeners.clone(),
                        nonce: nonce.to_string(),
                    }
                });

                if let Some(response) = response {
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }

                if updates.changed().await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
