//! In-memory container backend.
//!
//! Keeps containers in a map and applies projects with the same convergence
//! rules as the Docker backend: config hashes decide what is kept, init units
//! gate their dependents, orphans are left alone and every change is
//! broadcast as an event. Init units finish the moment they start, with exit
//! code 0 unless a test asks otherwise.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use edge_reconcile::{ConvergenceStatus, SpecHash};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use super::plan::{needs_start, plan_service};
use super::{
    BackendError, ContainerBackend, ContainerFilter, ContainerSummary, EngineEvent, EventKind,
    EventStream, LogOptions, LogStream, RunStatus, RuntimeContainer, RuntimeState,
};
use crate::labels;
use crate::project::{ApplyPolicy, Project, RestartPolicy, ServiceUnit};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Signal {
    Event(EngineEvent),
    Interrupt,
}

#[derive(Debug, Default)]
struct State {
    /// Containers in creation order.
    containers: Vec<RuntimeContainer>,
    networks: BTreeSet<String>,
    next_id: u64,
    logs: HashMap<String, Vec<Bytes>>,
    init_exit_codes: HashMap<String, i32>,
    fail_next_apply: Option<String>,
    created: u64,
    started: u64,
    subscriptions: u64,
}

/// A container engine that lives in memory.
pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(Signal::Event(event));
        }
    }

    /// Snapshot of every container.
    pub fn containers(&self) -> Vec<RuntimeContainer> {
        self.state().containers.clone()
    }

    /// The container of a service, if it exists.
    pub fn container(&self, service: &str) -> Option<RuntimeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.label(labels::SERVICE) == Some(service))
            .cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains(name)
    }

    /// Containers created so far, including replaced ones.
    pub fn created_count(&self) -> u64 {
        self.state().created
    }

    /// Container starts so far.
    pub fn start_count(&self) -> u64 {
        self.state().started
    }

    /// Event subscriptions opened so far.
    pub fn subscription_count(&self) -> u64 {
        self.state().subscriptions
    }

    /// Make the init unit `service` exit with `code` when it next starts.
    pub fn fail_init(&self, service: &str, code: i32) {
        self.state()
            .init_exit_codes
            .insert(service.to_string(), code);
    }

    /// Undo [`MemoryBackend::fail_init`].
    pub fn clear_init_failure(&self, service: &str) {
        self.state().init_exit_codes.remove(service);
    }

    /// Fail the next apply with an engine error.
    pub fn fail_next_apply(&self, message: &str) {
        self.state().fail_next_apply = Some(message.to_string());
    }

    /// Output returned by `logs` for the container of `service`.
    pub fn set_logs(&self, service: &str, chunks: &[&str]) {
        let chunks = chunks
            .iter()
            .map(|chunk| Bytes::copy_from_slice(chunk.as_bytes()))
            .collect();
        self.state().logs.insert(service.to_string(), chunks);
    }

    /// Mutate the container of `service` and broadcast `action` for it.
    ///
    /// Returns false if the service has no container.
    pub fn update_container<F>(&self, service: &str, action: &str, update: F) -> bool
    where
        F: FnOnce(&mut RuntimeContainer),
    {
        let event = {
            let mut state = self.state();
            let Some(container) = state
                .containers
                .iter_mut()
                .find(|c| c.label(labels::SERVICE) == Some(service))
            else {
                return false;
            };
            update(container);
            container_event(container, action)
        };
        self.publish(vec![event]);
        true
    }

    /// The container of `service` exits with `code`.
    pub fn exit(&self, service: &str, code: i32) -> bool {
        self.update_container(service, "die", |c| {
            c.state.status = RunStatus::Exited;
            c.state.running = false;
            c.state.restarting = false;
            c.state.exit_code = code;
            c.state.finished_at = Some(Utc::now());
        })
    }

    /// The container of `service` keeps dying with `code` and has been
    /// restarted `restarts` times.
    pub fn crash(&self, service: &str, code: i32, restarts: u32) -> bool {
        self.update_container(service, "die", |c| {
            c.state.status = RunStatus::Restarting;
            c.state.running = true;
            c.state.restarting = true;
            c.state.exit_code = code;
            c.state.finished_at = Some(Utc::now());
            c.restart_count = restarts;
        })
    }

    /// Add a running container that no project service owns.
    pub fn add_container(&self, name: &str, labels: BTreeMap<String, String>) -> String {
        let container = {
            let mut state = self.state();
            let id = state.next_container_id();
            let container = RuntimeContainer {
                id,
                name: name.to_string(),
                image: "busybox:latest".to_string(),
                created: Some(Utc::now()),
                restart_count: 0,
                labels,
                state: running_state(),
            };
            state.containers.push(container.clone());
            container
        };
        self.publish(vec![
            container_event(&container, "create"),
            container_event(&container, "start"),
        ]);
        container.id
    }

    /// Broadcast an arbitrary event.
    pub fn emit(&self, event: EngineEvent) {
        self.publish(vec![event]);
    }

    /// Break every open event stream with an error.
    pub fn interrupt_events(&self) {
        let _ = self.events.send(Signal::Interrupt);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn next_container_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }

    fn find_service(&self, project: &str, service: &str) -> Option<usize> {
        self.containers.iter().position(|c| {
            c.label(labels::PROJECT) == Some(project) && c.label(labels::SERVICE) == Some(service)
        })
    }

    fn apply(
        &mut self,
        project: &Project,
        policy: ApplyPolicy,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), BackendError> {
        for network in project.networks.values() {
            self.networks.insert(network.name.clone());
        }

        let mut recreated = HashSet::new();
        for service in &project.services {
            let existing = self.find_service(&project.name, &service.name);
            let current_hash = existing
                .and_then(|i| self.containers[i].label(labels::CONFIG_HASH))
                .map(str::to_string);
            let plan = plan_service(service, current_hash.as_deref(), policy, &recreated)?;

            let (index, fresh) = match (plan.status, existing) {
                (ConvergenceStatus::Converged, Some(index)) => (index, false),
                (_, existing) => {
                    if let Some(index) = existing {
                        let old = self.containers.remove(index);
                        events.push(container_event(&old, "destroy"));
                    }
                    recreated.insert(service.name.clone());
                    (self.create(project, service, &plan.hash, events), true)
                }
            };

            let state = &self.containers[index].state;
            if fresh || needs_start(service, state.status, Some(state.exit_code)) {
                self.check_dependencies(project, service)?;
                self.start(index, service, events);
            }
        }

        Ok(())
    }

    fn create(
        &mut self,
        project: &Project,
        service: &ServiceUnit,
        hash: &SpecHash,
        events: &mut Vec<EngineEvent>,
    ) -> usize {
        let mut container_labels = service.labels.clone();
        container_labels.insert(labels::CONFIG_HASH.to_string(), hash.to_string());
        container_labels.insert(labels::CONTAINER_NUMBER.to_string(), "1".to_string());

        let container = RuntimeContainer {
            id: self.next_container_id(),
            name: format!("{}-{}-1", project.name, service.name),
            image: service.image.clone(),
            created: Some(Utc::now()),
            restart_count: 0,
            labels: container_labels,
            state: RuntimeState::default(),
        };
        debug!(service = %service.name, id = %container.id, "Created container");

        events.push(container_event(&container, "create"));
        self.created += 1;
        self.containers.push(container);
        self.containers.len() - 1
    }

    fn start(&mut self, index: usize, service: &ServiceUnit, events: &mut Vec<EngineEvent>) {
        let exit_code = self.init_exit_codes.get(&service.name).copied().unwrap_or(0);
        let container = &mut self.containers[index];
        let now = Utc::now();

        container.state = running_state();
        events.push(container_event(container, "start"));

        if service.restart == RestartPolicy::No {
            container.state = RuntimeState {
                status: RunStatus::Exited,
                running: false,
                exit_code,
                error: String::new(),
                started_at: Some(now),
                finished_at: Some(now),
                restarting: false,
            };
            events.push(container_event(container, "die"));
        }
        self.started += 1;
    }

    fn check_dependencies(
        &self,
        project: &Project,
        service: &ServiceUnit,
    ) -> Result<(), BackendError> {
        for dependency in service.completion_dependencies() {
            let index = self.find_service(&project.name, dependency).ok_or_else(|| {
                BackendError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dependency.to_string(),
                }
            })?;
            let state = &self.containers[index].state;
            if state.status != RunStatus::Exited || state.exit_code != 0 {
                return Err(BackendError::DependencyFailed {
                    service: service.name.clone(),
                    dependency: dependency.to_string(),
                    exit_code: state.exit_code,
                });
            }
        }
        Ok(())
    }
}

fn running_state() -> RuntimeState {
    RuntimeState {
        status: RunStatus::Running,
        running: true,
        started_at: Some(Utc::now()),
        ..Default::default()
    }
}

fn container_event(container: &RuntimeContainer, action: &str) -> EngineEvent {
    let mut attributes = container.labels.clone();
    attributes.insert("name".to_string(), container.name.clone());
    attributes.insert("image".to_string(), container.image.clone());

    EngineEvent {
        kind: EventKind::Container,
        action: action.to_string(),
        actor_id: container.id.clone(),
        attributes,
        time: Utc::now(),
    }
}

#[async_trait]
impl ContainerBackend for MemoryBackend {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BackendError> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                image: c.image.clone(),
                labels: c.labels.clone(),
                state: c.state.status.as_str().to_string(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, BackendError> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn apply(&self, project: &Project, policy: ApplyPolicy) -> Result<(), BackendError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state();
            match state.fail_next_apply.take() {
                Some(message) => Err(BackendError::Api {
                    status: 500,
                    message,
                }),
                None => state.apply(project, policy, &mut events),
            }
        };
        self.publish(events);
        result
    }

    async fn teardown(&self, project: &str, services: &[String]) -> Result<(), BackendError> {
        let removed: Vec<RuntimeContainer> = {
            let mut state = self.state();
            let (removed, kept) = std::mem::take(&mut state.containers)
                .into_iter()
                .partition(|c| {
                    c.label(labels::PROJECT) == Some(project)
                        && c.label(labels::SERVICE)
                            .is_some_and(|s| services.iter().any(|name| name == s))
                });
            state.containers = kept;
            removed
        };

        let mut events = Vec::with_capacity(removed.len() * 2);
        for container in &removed {
            if container.state.running {
                events.push(container_event(container, "stop"));
            }
            events.push(container_event(container, "destroy"));
        }
        self.publish(events);
        Ok(())
    }

    async fn events(&self, filter: &ContainerFilter) -> Result<EventStream, BackendError> {
        let receiver = self.events.subscribe();
        self.state().subscriptions += 1;

        let filter = filter.clone();
        let stream = BroadcastStream::new(receiver).filter_map(move |signal| match signal {
            Ok(Signal::Event(event)) => filter.matches(&event.attributes).then_some(Ok(event)),
            Ok(Signal::Interrupt) => Some(Err(BackendError::StreamClosed)),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(BackendError::Lagged(missed))),
        });
        Ok(Box::pin(stream))
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, BackendError> {
        let chunks = {
            let state = self.state();
            let container = state
                .containers
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            let service = container.label(labels::SERVICE).unwrap_or_default();
            let mut chunks = state.logs.get(service).cloned().unwrap_or_default();
            let tail = options.tail as usize;
            if tail > 0 && chunks.len() > tail {
                chunks.drain(..chunks.len() - tail);
            }
            chunks
        };
        let recorded = futures_util::stream::iter(chunks.into_iter().map(Ok));
        if options.follow {
            // Nothing more is ever written; a follower waits until dropped.
            Ok(Box::pin(recorded.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(recorded))
        }
    }
}
