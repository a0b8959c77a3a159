//! Service sets: the engine-native description of a pod.
//!
//! A [`Project`] is what the translator produces and what backends apply.
//! Every type here serializes, and a service's serialized form is what its
//! config hash is computed from.

use std::collections::BTreeMap;
use std::path::PathBuf;

use edge_podspec::Protocol;
use edge_reconcile::SpecHash;
use serde::Serialize;

use crate::labels;

/// A named collection of services plus the networks they join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub name: String,

    /// Services in start order.
    pub services: Vec<ServiceUnit>,

    /// Networks keyed by their project-local key.
    pub networks: BTreeMap<String, NetworkDef>,
}

impl Project {
    pub fn service(&self, name: &str) -> Option<&ServiceUnit> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }
}

/// A network shared by services of the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkDef {
    /// Engine-side name.
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// One container's worth of definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceUnit {
    pub name: String,
    pub image: String,

    /// Command followed by its arguments. Empty keeps the image default.
    pub command: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub scale: u32,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<BindMount>,

    /// Networks to join, keyed by project network key.
    pub networks: BTreeMap<String, ServiceNetwork>,
    pub network_mode: NetworkMode,

    /// Services that must reach a condition before this one starts.
    pub depends_on: BTreeMap<String, DependencyCondition>,

    pub privileged: bool,
    pub tty: bool,
    pub pull_policy: PullPolicy,
}

impl ServiceUnit {
    /// Digest of this definition, stored on the container it produces.
    pub fn config_hash(&self) -> Result<SpecHash, serde_json::Error> {
        SpecHash::of(self)
    }

    /// Whether this service is a pod init unit.
    pub fn is_init(&self) -> bool {
        self.labels.get(labels::INIT_CONTAINER).map(String::as_str) == Some(labels::TRUE)
    }

    /// Names of dependencies that must complete successfully first.
    pub fn completion_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .filter(|(_, condition)| **condition == DependencyCondition::CompletedSuccessfully)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    No,
}

impl RestartPolicy {
    /// Engine restart policy name.
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull only when the image is not present locally.
    IfNotPresent,
    Always,
    Never,
}

impl PullPolicy {
    /// Map a pod `imagePullPolicy`. Unknown or unset values pull if absent.
    pub fn from_pod(policy: Option<&str>) -> Self {
        match policy {
            Some("Always") => PullPolicy::Always,
            Some("Never") => PullPolicy::Never,
            _ => PullPolicy::IfNotPresent,
        }
    }
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub target: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<u16>,

    pub protocol: Protocol,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

impl PortBinding {
    /// Engine port key, e.g. `80/tcp`.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.target, self.protocol.as_engine_str())
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Engine bind specification, `source:target[:ro]`.
    pub fn bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Attachment of a service to one project network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceNetwork {
    pub aliases: Vec<String>,
}

/// Where the container's network namespace comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Join the networks listed on the service.
    Bridge,

    /// Share the host's network namespace.
    Host,

    /// Share the namespace of another service of the project.
    Service(String),
}

impl NetworkMode {
    /// The service whose namespace is shared, if any.
    pub fn shared_service(&self) -> Option<&str> {
        match self {
            NetworkMode::Service(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency has been started.
    ServiceStarted,

    /// The dependency ran to completion with exit code 0.
    #[serde(rename = "service_completed_successfully")]
    CompletedSuccessfully,
}

/// How [`crate::backend::ContainerBackend::apply`] treats existing containers.
///
/// Project containers that belong to no planned service are never touched:
/// other pods share the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPolicy {
    pub recreate: Recreate,

    /// Applied to services whose network namespace provider was recreated.
    pub recreate_dependents: Recreate,
}

impl ApplyPolicy {
    /// Recreate only what diverged.
    pub fn converge() -> Self {
        Self {
            recreate: Recreate::Diverged,
            recreate_dependents: Recreate::Diverged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recreate {
    /// Recreate when the config hash changed.
    Diverged,
    Never,
}
