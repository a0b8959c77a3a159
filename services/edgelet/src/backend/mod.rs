//! Container backend abstraction.
//!
//! The engine talks to the container engine only through [`ContainerBackend`].
//! Two implementations exist: [`DockerBackend`] for a local Docker Engine, and
//! [`MemoryBackend`] which keeps containers in memory for tests and local
//! development.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use thiserror::Error;

use crate::project::{ApplyPolicy, Project};

pub mod docker;
pub mod memory;
mod plan;

pub use docker::DockerBackend;
pub use memory::MemoryBackend;

/// Engine lifecycle events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, BackendError>> + Send>>;

/// Raw container output.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// Errors from a container backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("service {service} cannot start: dependency {dependency} exited with code {exit_code}")]
    DependencyFailed {
        service: String,
        dependency: String,
        exit_code: i32,
    },

    #[error("service {service} references unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("event stream lagged, {0} events dropped")]
    Lagged(u64),

    #[error("event stream closed")]
    StreamClosed,
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Label equality filter. A container matches when it carries every pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub labels: BTreeMap<String, String>,
}

impl ContainerFilter {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// `key=value` pairs as the engine API expects them.
    pub fn label_args(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// A container as returned by a list call.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,

    /// Engine state name (`created`, `running`, `exited`, ...).
    pub state: String,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A fully inspected container.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,

    /// Image reference the container was created from.
    pub image: String,
    pub created: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub labels: BTreeMap<String, String>,
    pub state: RuntimeState,
}

impl RuntimeContainer {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Lifecycle state of an inspected container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeState {
    pub status: RunStatus,
    pub running: bool,
    pub restarting: bool,
    pub exit_code: i32,

    /// Error reported by the engine for the last run, if any.
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl RunStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "running" => RunStatus::Running,
            "paused" => RunStatus::Paused,
            "restarting" => RunStatus::Restarting,
            "removing" => RunStatus::Removing,
            "exited" => RunStatus::Exited,
            "dead" => RunStatus::Dead,
            _ => RunStatus::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Restarting => "restarting",
            RunStatus::Removing => "removing",
            RunStatus::Exited => "exited",
            RunStatus::Dead => "dead",
        }
    }
}

/// Category of an engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Container,
    Network,
    Image,
    Volume,
    Other(String),
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "container" => EventKind::Container,
            "network" => EventKind::Network,
            "image" => EventKind::Image,
            "volume" => EventKind::Volume,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// One engine lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub kind: EventKind,

    /// What happened (`create`, `start`, `die`, ...).
    pub action: String,

    /// Id of the object the event is about.
    pub actor_id: String,

    /// Container labels plus engine extras such as `name` and `image`.
    pub attributes: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
}

/// Options for [`ContainerBackend::logs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open for new output.
    pub follow: bool,

    /// Prefix every line with its timestamp.
    pub timestamps: bool,

    /// Only output after this point: RFC3339 or unix seconds.
    pub since: Option<String>,

    /// Only the last N lines. Zero means all.
    pub tail: u32,
}

/// Typed access to a container engine.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// List all containers (running or not) matching the filter.
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BackendError>;

    /// Inspect one container.
    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, BackendError>;

    /// Converge the engine onto the project.
    async fn apply(&self, project: &Project, policy: ApplyPolicy) -> Result<(), BackendError>;

    /// Stop and remove every container of the named services.
    async fn teardown(&self, project: &str, services: &[String]) -> Result<(), BackendError>;

    /// Subscribe to lifecycle events of matching containers.
    async fn events(&self, filter: &ContainerFilter) -> Result<EventStream, BackendError>;

    /// Stream a container's output.
    async fn logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, BackendError>;
}
