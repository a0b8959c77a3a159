//! Pod object model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Pod
// =============================================================================

/// A pod: one or more co-located containers scheduled together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,

    /// Fields the agent does not model, kept so the pod round-trips intact.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl Pod {
    /// The pod name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The pod namespace.
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`, for logging.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Look up a declared volume by name.
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.spec.volumes.iter().find(|v| v.name == name)
    }

    /// A copy of the pod with derived status removed.
    pub fn without_status(&self) -> Pod {
        Pod {
            status: PodStatus::default(),
            ..self.clone()
        }
    }
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Reference to the workload that owns a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// Spec
// =============================================================================

/// Desired state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Units that run to completion, in order, before any container starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub host_network: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// One container of a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Fields the agent does not model, kept so the pod round-trips intact.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl Container {
    /// Whether the container asks for privileged mode.
    pub fn privileged(&self) -> bool {
        self.security_context
            .as_ref()
            .and_then(|sc| sc.privileged)
            .unwrap_or(false)
    }
}

/// An environment variable.
///
/// Only literal values are injected; `valueFrom` references resolve against
/// cluster state the node does not have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<serde_json::Value>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Whether the value comes from a reference rather than a literal.
    pub fn is_reference(&self) -> bool {
        self.value.is_none() && self.value_from.is_some()
    }
}

/// A port exposed by a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub container_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Lowercase form used by container engines (`tcp`, `udp`, `sctp`).
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// Security settings of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Mount of a pod volume into a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,

    pub mount_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// Volumes
// =============================================================================

/// A named volume declared by a pod.
///
/// Only one source is expected to be set. Sources the agent does not know are
/// kept in `other` so the pod survives a serialization round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// The kind of a volume source, as far as the agent understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind<'a> {
    HostPath(&'a str),
    EmptyDir,
    ConfigMap,
    Secret,
    Unsupported,
}

impl Volume {
    /// Classify the volume source. The first recognised source wins.
    pub fn kind(&self) -> VolumeKind<'_> {
        if let Some(host_path) = &self.host_path {
            return VolumeKind::HostPath(&host_path.path);
        }
        if self.empty_dir.is_some() {
            return VolumeKind::EmptyDir;
        }
        if self.config_map.is_some() {
            return VolumeKind::ConfigMap;
        }
        if self.secret.is_some() {
            return VolumeKind::Secret;
        }
        VolumeKind::Unsupported
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathVolumeSource {
    pub path: String,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a pod. Always derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PodPhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(default, rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_container_statuses: Vec<ContainerStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Look up a condition by type.
    pub fn condition(&self, type_: PodConditionType) -> Option<&PodCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A pod-level condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub type_: PodConditionType,

    pub status: ConditionStatus,
}

impl PodCondition {
    pub fn new(type_: PodConditionType, holds: bool) -> Self {
        Self {
            type_,
            status: ConditionStatus::from(holds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodConditionType {
    Initialized,
    Ready,
    PodScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Observed state of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default, rename = "containerID", skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub restart_count: u32,

    #[serde(default)]
    pub state: ContainerState,

    #[serde(default)]
    pub last_state: ContainerState,
}

/// Exactly one of the fields is expected to be set; all unset means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<ContainerStateWaiting>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<ContainerStateRunning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<ContainerStateTerminated>,
}

impl ContainerState {
    pub fn running(started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            running: Some(ContainerStateRunning { started_at }),
            ..Default::default()
        }
    }

    pub fn waiting(reason: impl Into<String>) -> Self {
        Self {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.into()),
                message: None,
            }),
            ..Default::default()
        }
    }

    pub fn terminated(terminated: ContainerStateTerminated) -> Self {
        Self {
            terminated: Some(terminated),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateWaiting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateRunning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateTerminated {
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_deserializes_source_shape() {
        let json = serde_json::json!({
            "metadata": {
                "name": "nginx-2xclp",
                "namespace": "default",
                "labels": {"k8s-app": "nginx"},
                "ownerReferences": [{"apiVersion": "apps/v1", "kind": "DaemonSet", "name": "nginx"}]
            },
            "spec": {
                "containers": [{
                    "name": "web",
                    "image": "nginx:latest",
                    "ports": [{"containerPort": 80, "hostPort": 8080, "protocol": "TCP"}],
                    "volumeMounts": [{"name": "data", "mountPath": "/data", "readOnly": true}]
                }],
                "volumes": [{"name": "data", "hostPath": {"path": "/srv/data"}}],
                "hostNetwork": false
            }
        });

        let pod: Pod = serde_json::from_value(json).unwrap();
        assert_eq!(pod.name(), "nginx-2xclp");
        assert_eq!(pod.spec.containers[0].ports[0].host_port, Some(8080));
        assert!(pod.spec.containers[0].volume_mounts[0].read_only);
        assert_eq!(pod.volume("data").unwrap().kind(), VolumeKind::HostPath("/srv/data"));
        assert_eq!(pod.metadata.owner_references[0].name, "nginx");
    }

    #[test]
    fn test_unknown_volume_source_is_preserved() {
        let json = serde_json::json!({
            "name": "token",
            "projected": {"sources": [{"serviceAccountToken": {"path": "token"}}]}
        });

        let volume: Volume = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(volume.kind(), VolumeKind::Unsupported);
        assert!(volume.other.contains_key("projected"));
        assert_eq!(serde_json::to_value(&volume).unwrap(), json);
    }

    #[test]
    fn test_unmodelled_fields_survive_round_trip() {
        let json = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "deletionGracePeriodSeconds": 30,
                "ownerReferences": [{"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web", "controller": true}]
            },
            "spec": {
                "tolerations": [{"key": "edge", "operator": "Exists"}],
                "containers": [{
                    "name": "app",
                    "image": "nginx",
                    "resources": {"limits": {"cpu": "250m"}},
                    "livenessProbe": {"httpGet": {"path": "/", "port": 80}},
                    "env": [
                        {"name": "MODE", "value": "edge"},
                        {"name": "POD_IP", "valueFrom": {"fieldRef": {"fieldPath": "status.podIP"}}}
                    ],
                    "ports": [{"containerPort": 80, "protocol": "TCP", "appProtocol": "http"}],
                    "volumeMounts": [{"name": "conf", "mountPath": "/etc/app", "mountPropagation": "None"}],
                    "securityContext": {"privileged": false, "runAsUser": 1000}
                }],
                "volumes": [
                    {"name": "conf", "configMap": {"name": "app", "items": [{"key": "a", "path": "a.conf"}]}},
                    {"name": "tls", "secret": {"secretName": "tls", "optional": true}},
                    {"name": "data", "hostPath": {"path": "/srv", "type": "Directory"}},
                    {"name": "tmp", "emptyDir": {"sizeLimit": "1Gi"}}
                ]
            }
        });

        let pod: Pod = serde_json::from_value(json.clone()).unwrap();
        assert!(pod.spec.other.contains_key("tolerations"));
        assert!(pod.spec.containers[0].env[1].is_reference());
        assert!(!pod.spec.containers[0].env[0].is_reference());

        let mut back = serde_json::to_value(&pod).unwrap();
        back.as_object_mut().unwrap().remove("status");
        assert_eq!(back, json);
    }

    #[test]
    fn test_condition_status_serialization() {
        let condition = PodCondition::new(PodConditionType::Ready, false);
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Ready", "status": "False"}));
    }

    #[test]
    fn test_status_ip_field_names() {
        let status = PodStatus {
            host_ip: Some("10.0.0.5".to_string()),
            pod_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"hostIP\":\"10.0.0.5\""));
        assert!(json.contains("\"podIP\":\"10.0.0.5\""));
    }

    #[test]
    fn test_without_status_clears_derived_state() {
        let mut pod = Pod::default();
        pod.metadata.name = "p".to_string();
        pod.status.phase = Some(PodPhase::Running);

        let stripped = pod.without_status();
        assert_eq!(stripped.status, PodStatus::default());
        assert_eq!(stripped.metadata, pod.metadata);
    }
}
