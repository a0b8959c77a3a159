//! The agent's RPC-facing surface.
//!
//! [`Edgelet`] fronts whichever [`PodManager`] serves the node, adds node
//! facts to status polls, and pumps container output to a caller-supplied
//! sink.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use edge_podspec::Pod;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::backend::LogOptions;
use crate::error::PodError;
use crate::manager::PodManager;
use crate::node::{NodeInfo, NodeStatusReport};

/// A request for the output of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub options: LogOptions,
}

/// Edge node agent.
pub struct Edgelet {
    manager: Arc<dyn PodManager>,
    node: NodeInfo,
}

impl Edgelet {
    pub fn new(manager: Arc<dyn PodManager>, node: NodeInfo) -> Self {
        Self { manager, node }
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    #[instrument(skip_all, fields(pod = %pod.key()))]
    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod, PodError> {
        info!("Creating pod");
        self.manager.create_pod(pod).await
    }

    #[instrument(skip_all, fields(pod = %pod.key()))]
    pub async fn update_pod(&self, pod: &Pod) -> Result<Pod, PodError> {
        info!("Updating pod");
        self.manager.update_pod(pod).await
    }

    #[instrument(skip_all, fields(pod = %pod.key()))]
    pub async fn delete_pod(&self, pod: &Pod) -> Result<(), PodError> {
        info!("Deleting pod");
        self.manager.delete_pod(pod).await
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodError> {
        self.manager.get_pod(namespace, name).await
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>, PodError> {
        self.manager.list_pods().await
    }

    /// Pods changed since the previous poll, plus current node facts.
    pub async fn describe_node_status(&self) -> Result<NodeStatusReport, PodError> {
        let changed_pods = self.manager.describe_changes().await?;
        Ok(NodeStatusReport {
            changed_pods,
            node: self.node.status(Utc::now()),
        })
    }

    /// Copy a unit's output into `sink`.
    ///
    /// Returns the number of bytes delivered once the output ends, the sink
    /// is closed, or `cancel` fires. The engine stream is released on every
    /// path.
    #[instrument(skip_all, fields(pod = %request.pod, container = %request.container))]
    pub async fn get_container_logs(
        &self,
        request: &LogRequest,
        sink: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<u64, PodError> {
        let mut stream = self
            .manager
            .container_logs(
                &request.namespace,
                &request.pod,
                &request.container,
                &request.options,
            )
            .await?;

        let mut delivered = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(delivered, "Log stream cancelled");
                    break;
                }
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!(delivered, "Log stream ended");
                    break;
                }
            };

            let len = bytes.len() as u64;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(delivered, "Log stream cancelled");
                    break;
                }
                sent = sink.send(bytes) => {
                    if sent.is_err() {
                        debug!(delivered, "Log receiver closed");
                        break;
                    }
                    delivered += len;
                }
            }
        }

        Ok(delivered)
    }
}
