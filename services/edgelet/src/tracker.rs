//! Event-driven change tracking.
//!
//! A background loop follows the backend's container events and records which
//! pods changed. Status polls drain that set instead of re-listing every
//! container.
//!
//! The dirty-set lock is only held to insert or drain, never across a backend
//! call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use edge_reconcile::BackoffPolicy;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::{ContainerBackend, EngineEvent, EventKind};
use crate::labels;

/// Consecutive failed subscriptions after which failures log at error.
const ESCALATE_AFTER: u32 = 5;

/// A container event attributed to a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodEvent {
    pub pod: String,
    pub service: String,

    /// Unit name within the pod.
    pub container: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,

    /// Event attributes without engine-internal labels.
    pub attributes: BTreeMap<String, String>,
}

impl PodEvent {
    /// Attribute an engine event to a pod. Non-container events and events
    /// without a pod service label yield `None`.
    pub fn from_engine(event: &EngineEvent) -> Option<Self> {
        if event.kind != EventKind::Container {
            return None;
        }
        let service = event.attributes.get(labels::SERVICE)?;
        let (pod, container) = labels::parse_service_name(service)?;

        let attributes = event
            .attributes
            .iter()
            .filter(|(key, _)| !key.starts_with(labels::COMPOSE_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            pod: pod.to_string(),
            service: service.clone(),
            container: container.to_string(),
            action: event.action.clone(),
            timestamp: event.time,
            attributes,
        })
    }
}

/// Set of pod names changed since the last drain.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    dirty: Mutex<BTreeSet<String>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn dirty(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark(&self, pod: impl Into<String>) {
        self.dirty().insert(pod.into());
    }

    /// Take every pending name, leaving the set empty.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.dirty()).into_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.dirty().len()
    }

    /// Record an engine event. Returns the pod event it was attributed to.
    pub fn observe(&self, event: &EngineEvent) -> Option<PodEvent> {
        let pod_event = PodEvent::from_engine(event)?;
        debug!(
            pod = %pod_event.pod,
            container = %pod_event.container,
            action = %pod_event.action,
            attributes = ?pod_event.attributes,
            "Container event"
        );
        self.mark(pod_event.pod.clone());
        Some(pod_event)
    }

    /// Mark every pod that currently has containers in the project.
    ///
    /// Used after the event stream was re-established, since events emitted
    /// while disconnected are lost.
    pub async fn resync(&self, backend: &dyn ContainerBackend, project: &str) {
        match backend
            .list_containers(&labels::project_filter(project))
            .await
        {
            Ok(containers) => {
                let pods: BTreeSet<String> = containers
                    .iter()
                    .filter_map(|c| c.label(labels::SERVICE))
                    .filter_map(labels::parse_service_name)
                    .map(|(pod, _)| pod.to_string())
                    .collect();
                debug!(pods = pods.len(), "Resynced pods after reconnect");
                self.dirty().extend(pods);
            }
            Err(e) => warn!(error = %e, "Failed to resync pods after reconnect"),
        }
    }

    /// Follow the backend's events for `project` until shutdown.
    ///
    /// Stream errors and stream ends are retried with backoff; the loop only
    /// returns once `shutdown` turns true or its sender is gone.
    pub async fn run(
        self: Arc<Self>,
        backend: Arc<dyn ContainerBackend>,
        project: String,
        backoff: BackoffPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let filter = labels::project_filter(&project);
        let mut failures: u32 = 0;
        let mut reconnecting = false;

        info!(project = %project, "Change tracker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                result = backend.events(&filter) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match subscribed {
                Ok(mut events) => {
                    if reconnecting {
                        info!("Event stream re-established");
                        self.resync(backend.as_ref(), &project).await;
                    }
                    reconnecting = true;

                    loop {
                        tokio::select! {
                            item = events.next() => match item {
                                Some(Ok(event)) => {
                                    failures = 0;
                                    self.observe(&event);
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Event stream error");
                                    break;
                                }
                                None => {
                                    warn!("Event stream ended");
                                    break;
                                }
                            },
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    info!("Change tracker stopped");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    reconnecting = true;
                    if failures >= ESCALATE_AFTER {
                        error!(error = %e, failures, "Cannot subscribe to engine events");
                    } else {
                        warn!(error = %e, failures, "Failed to subscribe to engine events");
                    }
                }
            }

            let delay = backoff.delay(failures);
            failures = failures.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to event stream");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Change tracker stopped");
    }
}
