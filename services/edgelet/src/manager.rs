//! Pod managers behind the RPC surface.
//!
//! The agent either runs pods itself ([`PodEngine`]) or runs inside an
//! orchestrator-managed host that owns the pods ([`HostedPodManager`]). The
//! choice is made once at start-up.

use async_trait::async_trait;
use edge_podspec::Pod;

use crate::backend::{LogOptions, LogStream};
use crate::engine::PodEngine;
use crate::error::PodError;

/// Operations a pod manager offers.
#[async_trait]
pub trait PodManager: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, PodError>;

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, PodError>;

    async fn delete_pod(&self, pod: &Pod) -> Result<(), PodError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodError>;

    async fn list_pods(&self) -> Result<Vec<Pod>, PodError>;

    /// Pods changed since the previous call.
    async fn describe_changes(&self) -> Result<Vec<Pod>, PodError>;

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<LogStream, PodError>;
}

#[async_trait]
impl PodManager for PodEngine {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, PodError> {
        self.create_or_update(pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, PodError> {
        self.create_or_update(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), PodError> {
        self.delete(pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PodError> {
        self.get(namespace, name).await
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, PodError> {
        self.list().await
    }

    async fn describe_changes(&self) -> Result<Vec<Pod>, PodError> {
        PodEngine::describe_changes(self).await
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<LogStream, PodError> {
        PodEngine::container_logs(self, namespace, pod, container, options).await
    }
}

/// Manager used when an orchestrator hosts the node: pods belong to it, so
/// every operation is refused.
#[derive(Debug, Default)]
pub struct HostedPodManager;

impl HostedPodManager {
    fn refuse<T>(operation: &str) -> Result<T, PodError> {
        Err(PodError::Unsupported(format!(
            "{operation} is handled by the hosting orchestrator"
        )))
    }
}

#[async_trait]
impl PodManager for HostedPodManager {
    async fn create_pod(&self, _pod: &Pod) -> Result<Pod, PodError> {
        Self::refuse("create pod")
    }

    async fn update_pod(&self, _pod: &Pod) -> Result<Pod, PodError> {
        Self::refuse("update pod")
    }

    async fn delete_pod(&self, _pod: &Pod) -> Result<(), PodError> {
        Self::refuse("delete pod")
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Pod, PodError> {
        Self::refuse("get pod")
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, PodError> {
        Self::refuse("list pods")
    }

    async fn describe_changes(&self) -> Result<Vec<Pod>, PodError> {
        Self::refuse("describe changes")
    }

    async fn container_logs(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        _options: &LogOptions,
    ) -> Result<LogStream, PodError> {
        Self::refuse("container logs")
    }
}

/// Which manager serves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    /// Pods run on the local container engine.
    LocalEngine,

    /// An orchestrator hosts this node.
    Hosted,
}

impl ManagerKind {
    pub fn detect(hosted: bool) -> Self {
        if hosted {
            ManagerKind::Hosted
        } else {
            ManagerKind::LocalEngine
        }
    }
}

#[cfg(test)]
mod tests {
    use edge_testing::pod_with_init;

    use super::*;

    #[tokio::test]
    async fn test_hosted_manager_refuses() {
        let manager = HostedPodManager;
        let err = manager.create_pod(&pod_with_init("web")).await.unwrap_err();
        assert_eq!(err.reason_code(), "unsupported");
        assert!(manager.list_pods().await.is_err());
        assert!(manager.describe_changes().await.is_err());
    }

    #[test]
    fn test_detect() {
        assert_eq!(ManagerKind::detect(true), ManagerKind::Hosted);
        assert_eq!(ManagerKind::detect(false), ManagerKind::LocalEngine);
    }
}
