//! Container label keys and service naming.
//!
//! Pods are found again purely through labels: every container carries the
//! project, its service name, the pod identity and the full pod itself.

use edge_podspec::UNIT_NAME_SEPARATOR;

use crate::backend::ContainerFilter;

/// Compose project the container belongs to.
pub const PROJECT: &str = "com.docker.compose.project";

/// Compose service the container was created for.
pub const SERVICE: &str = "com.docker.compose.service";

/// One-off marker. Always `False` for pod units.
pub const ONEOFF: &str = "com.docker.compose.oneoff";

/// Digest of the service definition the container was created from.
pub const CONFIG_HASH: &str = "com.docker.compose.config-hash";

/// Replica number within the service.
pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";

/// Prefix shared by all engine-internal labels.
pub const COMPOSE_PREFIX: &str = "com.docker.compose.";

pub const NAMESPACE: &str = "k8s-namespace";
pub const POD_NAME: &str = "k8s-podname";

/// The whole pod, serialized as JSON.
pub const POD_INFO: &str = "k8s-podinfo";

/// Present (`true`) on init units only.
pub const INIT_CONTAINER: &str = "k8s-initContainer";

/// Pod labels that name the app, in lookup order, for network aliases.
pub const APP_LABELS: [&str; 2] = ["k8s-app", "app"];

pub const ONEOFF_FALSE: &str = "False";
pub const TRUE: &str = "true";

/// Key of the project network inside a service set.
pub const DEFAULT_NETWORK: &str = "default";

/// Service name of a pod unit: `{pod}.{unit}`.
pub fn service_name(pod: &str, unit: &str) -> String {
    format!("{pod}{UNIT_NAME_SEPARATOR}{unit}")
}

/// Split a service name back into `(pod, unit)`.
///
/// The unit is the last segment, so pod names may themselves contain the
/// separator. Names without a separator, or with an empty side, are not pod
/// services.
pub fn parse_service_name(service: &str) -> Option<(&str, &str)> {
    let (pod, unit) = service.rsplit_once(UNIT_NAME_SEPARATOR)?;
    if pod.is_empty() || unit.is_empty() {
        return None;
    }
    Some((pod, unit))
}

/// Engine-side name of the project network.
pub fn network_name(project: &str) -> String {
    format!("{project}_{DEFAULT_NETWORK}")
}

/// Every container of the project.
pub fn project_filter(project: &str) -> ContainerFilter {
    ContainerFilter::default().label(PROJECT, project)
}

/// Containers of one pod. An empty namespace matches any namespace.
pub fn pod_filter(project: &str, namespace: &str, pod: &str) -> ContainerFilter {
    let filter = project_filter(project).label(POD_NAME, pod);
    if namespace.is_empty() {
        filter
    } else {
        filter.label(NAMESPACE, namespace)
    }
}

/// Containers of one service.
pub fn service_filter(project: &str, service: &str) -> ContainerFilter {
    project_filter(project).label(SERVICE, service)
}
