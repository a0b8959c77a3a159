//! Docker Engine API request and response bodies.
//!
//! Reference: https://docs.docker.com/engine/api/latest/

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{
    ContainerSummary, EngineEvent, EventKind, RunStatus, RuntimeContainer, RuntimeState,
};

// =============================================================================
// Responses
// =============================================================================

/// Body of an error response.
#[derive(Debug, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// One entry of `GET /containers/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerListEntry {
    pub id: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub state: String,
}

impl From<ContainerListEntry> for ContainerSummary {
    fn from(entry: ContainerListEntry) -> Self {
        Self {
            id: entry.id,
            image: entry.image,
            labels: entry.labels.unwrap_or_default(),
            state: entry.state,
        }
    }
}

/// `GET /containers/{id}/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub created: Option<String>,

    #[serde(default)]
    pub restart_count: u32,

    #[serde(default)]
    pub state: InspectState,

    #[serde(default)]
    pub config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub running: bool,

    #[serde(default)]
    pub restarting: bool,

    #[serde(default)]
    pub exit_code: i32,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub started_at: Option<String>,

    #[serde(default)]
    pub finished_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

impl From<ContainerInspect> for RuntimeContainer {
    fn from(inspect: ContainerInspect) -> Self {
        let state = inspect.state;
        Self {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            image: inspect.config.image,
            created: parse_time(inspect.created.as_deref()),
            restart_count: inspect.restart_count,
            labels: inspect.config.labels.unwrap_or_default(),
            state: RuntimeState {
                status: RunStatus::parse(&state.status),
                running: state.running,
                restarting: state.restarting,
                exit_code: state.exit_code,
                error: state.error,
                started_at: parse_time(state.started_at.as_deref()),
                finished_at: parse_time(state.finished_at.as_deref()),
            },
        }
    }
}

/// Engine timestamps; the zero time (`0001-01-01T00:00:00Z`) means unset.
fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value?).ok()?.with_timezone(&Utc);
    (parsed.year() > 1).then_some(parsed)
}

/// `POST /containers/create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    pub id: String,

    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// `POST /containers/{id}/wait`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,

    #[serde(default)]
    pub error: Option<WaitError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitError {
    #[serde(default)]
    pub message: String,
}

/// One line of `GET /events`.
#[derive(Debug, Deserialize)]
pub struct Event {
    #[serde(rename = "Type", default)]
    pub type_: String,

    #[serde(rename = "Action", default)]
    pub action: String,

    #[serde(rename = "Actor", default)]
    pub actor: Actor,

    #[serde(default)]
    pub time: i64,

    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Attributes", default)]
    pub attributes: BTreeMap<String, String>,
}

impl From<Event> for EngineEvent {
    fn from(event: Event) -> Self {
        let time = if event.time_nano > 0 {
            Utc.timestamp_nanos(event.time_nano)
        } else {
            Utc.timestamp_opt(event.time, 0)
                .single()
                .unwrap_or_else(Utc::now)
        };

        Self {
            kind: EventKind::parse(&event.type_),
            action: event.action,
            actor_id: event.actor.id,
            attributes: event.actor.attributes,
            time,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// `POST /containers/create`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub tty: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    pub exposed_ports: BTreeMap<String, Empty>,
    pub host_config: HostConfig,
    pub networking_config: NetworkingConfig,
}

/// Serializes as `{}`.
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub port_bindings: BTreeMap<String, Vec<HostPort>>,
    pub restart_policy: RestartPolicySpec,
    pub network_mode: String,
    pub privileged: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPort {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicySpec {
    pub name: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    pub endpoints_config: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointSettings {
    pub aliases: Vec<String>,
}

/// `POST /networks/create`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetwork {
    pub name: String,
    pub driver: String,
    pub labels: BTreeMap<String, String>,
    pub check_duplicate: bool,
}
