//! Pod execution engine.
//!
//! Realizes pods on a [`ContainerBackend`] and reads them back. There is no
//! state store: the containers, and the pod embedded in their labels, are the
//! only record of what runs on this node.
//!
//! Creates, updates and deletes for every pod of the node are serialized by
//! one lock, since applying overlapping service sets is not safe to run
//! concurrently. Reads never take it.
//!
//! Every operation is a future; dropping it cancels the backend calls in
//! flight. A cancelled apply leaves whatever it got to, and the next
//! [`PodEngine::create_or_update`] converges from there.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use edge_podspec::Pod;
use edge_reconcile::BackoffPolicy;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    ContainerBackend, ContainerSummary, LogOptions, LogStream, RuntimeContainer,
};
use crate::config::{Config, VolumeRoots};
use crate::error::PodError;
use crate::labels;
use crate::project::{ApplyPolicy, Project};
use crate::reconstruct::reconstruct;
use crate::tracker::ChangeTracker;
use crate::translate::{service_names, translate};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Engine project every pod of the node lives in.
    pub project: String,

    pub volume_roots: VolumeRoots,

    /// Reported as host and pod IP.
    pub node_ip: Option<String>,

    /// Reconnect backoff for the event stream.
    pub event_backoff: BackoffPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            project: config.project.clone(),
            volume_roots: config.volume_roots(),
            node_ip: Some(config.node_ip.clone()),
            event_backoff: BackoffPolicy::default(),
        }
    }
}

/// Pod execution engine.
pub struct PodEngine {
    backend: Arc<dyn ContainerBackend>,
    settings: EngineSettings,
    tracker: Arc<ChangeTracker>,

    /// Serializes every mutation on the node.
    mutation: Mutex<()>,
}

impl PodEngine {
    pub fn new(backend: Arc<dyn ContainerBackend>, settings: EngineSettings) -> Self {
        Self {
            backend,
            settings,
            tracker: Arc::new(ChangeTracker::new()),
            mutation: Mutex::new(()),
        }
    }

    pub fn project(&self) -> &str {
        &self.settings.project
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    /// Start following backend events. The task ends on shutdown.
    pub fn spawn_tracker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(tracker.run(
            Arc::clone(&self.backend),
            self.settings.project.clone(),
            self.settings.event_backoff.clone(),
            shutdown,
        ))
    }

    /// Create or update a pod, then return its status as read back from the
    /// backend.
    ///
    /// Invalid pods are rejected before the backend is contacted. Backend
    /// failures are returned without rollback; calling again converges.
    pub async fn create_or_update(&self, pod: &Pod) -> Result<Pod, PodError> {
        let project = translate(pod, &self.settings.project, &self.settings.volume_roots)?;

        {
            let _guard = self.mutation.lock().await;
            info!(
                pod = %pod.key(),
                services = project.services.len(),
                "Applying pod"
            );

            if let Err(e) = self.backend.apply(&project, ApplyPolicy::converge()).await {
                warn!(pod = %pod.key(), error = %e, "Apply failed");
                return Err(e.into());
            }
            self.prune_removed_units(pod, &project).await?;
        }

        self.get(pod.namespace(), pod.name()).await
    }

    /// Remove units an update dropped from the pod. Other pods' services are
    /// never touched.
    async fn prune_removed_units(&self, pod: &Pod, project: &Project) -> Result<(), PodError> {
        let planned: BTreeSet<String> = project.service_names().into_iter().collect();
        let filter = labels::pod_filter(&self.settings.project, pod.namespace(), pod.name());

        let stale: Vec<String> = self
            .backend
            .list_containers(&filter)
            .await?
            .iter()
            .filter_map(|c| c.label(labels::SERVICE))
            .filter(|service| !planned.contains(*service))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if !stale.is_empty() {
            info!(pod = %pod.key(), services = ?stale, "Removing units dropped from pod");
            self.backend.teardown(&self.settings.project, &stale).await?;
        }
        Ok(())
    }

    /// Tear down every unit of a pod.
    pub async fn delete(&self, pod: &Pod) -> Result<(), PodError> {
        if pod.namespace().is_empty() || pod.name().is_empty() {
            return Err(PodError::MissingIdentity);
        }

        let _guard = self.mutation.lock().await;

        let filter = labels::pod_filter(&self.settings.project, pod.namespace(), pod.name());
        let existing = self.backend.list_containers(&filter).await?;
        if existing.is_empty() {
            return Err(PodError::not_found(pod.namespace(), pod.name()));
        }

        // Units known to the engine but missing from the given spec go too.
        let mut services: BTreeSet<String> = service_names(pod).into_iter().collect();
        services.extend(
            existing
                .iter()
                .filter_map(|c| c.label(labels::SERVICE))
                .map(str::to_string),
        );
        let services: Vec<String> = services.into_iter().collect();

        info!(pod = %pod.key(), services = ?services, "Deleting pod");
        self.backend
            .teardown(&self.settings.project, &services)
            .await?;
        Ok(())
    }

    /// Read a pod back from its containers. An empty namespace matches any.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<Pod, PodError> {
        let filter = labels::pod_filter(&self.settings.project, namespace, name);
        let summaries = self.backend.list_containers(&filter).await?;
        let containers = self.inspect_all(&summaries).await?;

        if containers.is_empty() {
            return Err(PodError::not_found(namespace, name));
        }
        reconstruct(&containers, self.settings.node_ip.as_deref())
    }

    /// Every pod of the project. Pods that cannot be decoded are logged and
    /// left out.
    pub async fn list(&self) -> Result<Vec<Pod>, PodError> {
        let summaries = self
            .backend
            .list_containers(&labels::project_filter(&self.settings.project))
            .await?;

        let mut groups: BTreeMap<String, Vec<ContainerSummary>> = BTreeMap::new();
        for summary in summaries {
            let Some((pod, _)) = summary
                .label(labels::SERVICE)
                .and_then(labels::parse_service_name)
            else {
                continue;
            };
            groups.entry(pod.to_string()).or_default().push(summary);
        }

        let mut pods = Vec::with_capacity(groups.len());
        for (name, group) in groups {
            let containers = self.inspect_all(&group).await?;
            if containers.is_empty() {
                continue;
            }
            match reconstruct(&containers, self.settings.node_ip.as_deref()) {
                Ok(pod) => pods.push(pod),
                Err(e) => warn!(pod = %name, error = %e, "Omitting pod"),
            }
        }
        Ok(pods)
    }

    /// Pods changed since the last call.
    ///
    /// Names that no longer resolve are dropped. A name whose read failed on
    /// the backend is kept for the next call.
    pub async fn describe_changes(&self) -> Result<Vec<Pod>, PodError> {
        let names = self.tracker.drain();
        let mut pods = Vec::with_capacity(names.len());

        for name in names {
            match self.get("", &name).await {
                Ok(pod) => pods.push(pod),
                Err(e) if e.is_not_found() => {
                    debug!(pod = %name, "Changed pod no longer exists");
                }
                Err(PodError::Backend(e)) => {
                    warn!(pod = %name, error = %e, "Failed to read changed pod, retrying next poll");
                    self.tracker.mark(name);
                }
                Err(e) => warn!(pod = %name, error = %e, "Omitting changed pod"),
            }
        }
        Ok(pods)
    }

    /// Output of one unit of a pod.
    pub async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<LogStream, PodError> {
        let service = labels::service_name(pod, container);
        let mut filter = labels::service_filter(&self.settings.project, &service);
        if !namespace.is_empty() {
            filter = filter.label(labels::NAMESPACE, namespace);
        }

        let not_found = || PodError::not_found(namespace, format!("{pod}/{container}"));
        let found = self.backend.list_containers(&filter).await?;
        let target = found.first().ok_or_else(not_found)?;

        match self.backend.logs(&target.id, options).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_not_found() => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Inspect listed containers, skipping any removed in the meantime.
    async fn inspect_all(
        &self,
        summaries: &[ContainerSummary],
    ) -> Result<Vec<RuntimeContainer>, PodError> {
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match self.backend.inspect_container(&summary.id).await {
                Ok(container) => containers.push(container),
                Err(e) if e.is_not_found() => {
                    debug!(id = %summary.id, "Container vanished before inspect");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(containers)
    }
}
