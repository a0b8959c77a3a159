//! Node status reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edge_podspec::{ConditionStatus, Pod};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, NodeCapacity};
use crate::service::Edgelet;

/// Identity and static facts of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    pub capacity: NodeCapacity,
}

impl NodeInfo {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.node_name.clone(),
            address: config.node_ip.clone(),
            capacity: config.capacity,
        }
    }

    /// Node status as of `now`.
    pub fn status(&self, now: DateTime<Utc>) -> NodeStatus {
        let resources = BTreeMap::from([
            ("cpu".to_string(), self.capacity.cpu.to_string()),
            ("memory".to_string(), format!("{}Gi", self.capacity.memory_gib)),
            ("pods".to_string(), self.capacity.pods.to_string()),
        ]);

        NodeStatus {
            name: self.name.clone(),
            address: self.address.clone(),
            phase: NodePhase::Running,
            capacity: resources.clone(),
            allocatable: resources,
            conditions: vec![NodeCondition {
                type_: "Ready".to_string(),
                status: ConditionStatus::True,
                reason: "EdgeletReady".to_string(),
                last_heartbeat_time: now,
            }],
            heartbeat_time: now,
        }
    }
}

/// Answer to a node status poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusReport {
    /// Pods changed since the previous poll.
    pub changed_pods: Vec<Pod>,
    pub node: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub address: String,
    pub phase: NodePhase,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
    pub conditions: Vec<NodeCondition>,
    pub heartbeat_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodePhase {
    Pending,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub last_heartbeat_time: DateTime<Utc>,
}

/// Poll node status every `interval` until shutdown, logging what changed.
pub async fn run_status_loop(
    edgelet: Arc<Edgelet>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting node status loop");

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match edgelet.describe_node_status().await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        for pod in &report.changed_pods {
                            info!(
                                pod = %pod.key(),
                                phase = ?pod.status.phase,
                                "Pod status changed"
                            );
                        }
                        debug!(changed = report.changed_pods.len(), "Node status collected");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Node status failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Node status failed repeatedly");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Node status loop shutting down");
                    break;
                }
            }
        }
    }
}
