//! Tonic implementation of the `AgwService` snapshot stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::proto;
use crate::proto::agw_service_server::AgwService;
use crate::xds::XdsState;

/// gRPC service handing each connected data plane its own snapshot stream.
pub struct AgwServiceImpl {
    state: Arc<XdsState>,
}

impl AgwServiceImpl {
    pub fn new(state: Arc<XdsState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl AgwService for AgwServiceImpl {
    type StreamConfigStream = ReceiverStream<Result<proto::ConfigSnapshot, Status>>;

    async fn stream_config(
        &self,
        request: Request<proto::Node>,
    ) -> Result<Response<Self::StreamConfigStream>, Status> {
        let node = request.into_inner();
        info!(
            node_id = %node.id,
            region = %node.region,
            version = %node.version,
            "Data plane connected"
        );

        let (id, mut updates) = self.state.subscribe();
        let (tx, rx) = mpsc::channel(1);

        let state = self.state.clone();
        let node_id = node.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_snapshot = updates.recv() => match maybe_snapshot {
                        Some(snapshot) => {
                            if tx.send(Ok(snapshot)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    // Disconnect detection: tonic drops the output stream when
                    // the client goes away, so unregister promptly.
                    _ = tx.closed() => break,
                }
            }
            state.unsubscribe(id);
            info!(node_id = %node_id, subscriber = id, "Data plane disconnected");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
