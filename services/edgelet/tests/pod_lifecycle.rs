//! Integration tests for the pod lifecycle.
//!
//! These tests drive the engine end to end against the in-memory backend:
//! 1. Pods are translated and applied
//! 2. Status is read back from container state alone
//! 3. Engine events mark pods as changed for status polls

use std::sync::Arc;
use std::time::Duration;

use edge_podspec::{ConditionStatus, Pod, PodConditionType, PodPhase};
use edge_reconcile::BackoffPolicy;
use edge_testing::{nginx_pod, pod_with_init, NAMESPACE};
use edgelet::backend::{BackendError, MemoryBackend};
use edgelet::config::VolumeRoots;
use edgelet::labels;
use edgelet::reconstruct::reason;
use edgelet::{EngineSettings, PodEngine, PodError};
use tokio::sync::watch;

struct Node {
    backend: Arc<MemoryBackend>,
    engine: PodEngine,
    _data_dir: tempfile::TempDir,
}

fn node() -> Node {
    let data_dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let settings = EngineSettings {
        project: "edge".to_string(),
        volume_roots: VolumeRoots::under(data_dir.path()),
        node_ip: Some("10.0.0.5".to_string()),
        event_backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        },
    };
    let engine = PodEngine::new(backend.clone(), settings);
    Node {
        backend,
        engine,
        _data_dir: data_dir,
    }
}

fn holds(pod: &Pod, type_: PodConditionType) -> bool {
    pod.status.condition(type_).map(|c| c.status) == Some(ConditionStatus::True)
}

/// Poll `check` until it holds or a second has passed.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_init_then_app() {
    let node = node();

    let pod = node.engine.create_or_update(&pod_with_init("web")).await.unwrap();

    assert_eq!(pod.status.phase, Some(PodPhase::Running));
    assert!(holds(&pod, PodConditionType::Initialized));
    assert!(holds(&pod, PodConditionType::Ready));
    assert_eq!(pod.status.pod_ip.as_deref(), Some("10.0.0.5"));

    let init = &pod.status.init_container_statuses[0];
    let terminated = init.state.terminated.as_ref().unwrap();
    assert_eq!(terminated.exit_code, 0);
    assert_eq!(terminated.reason.as_deref(), Some(reason::COMPLETED));

    let app = &pod.status.container_statuses[0];
    assert!(app.ready);
    assert!(app.state.running.is_some());

    assert!(node.backend.has_network(&labels::network_name("edge")));
    let container = node.backend.container("web.app").unwrap();
    assert_eq!(container.name, "edge-web.app-1");
    assert_eq!(container.label(labels::NAMESPACE), Some(NAMESPACE));
}

#[tokio::test]
async fn test_reapply_is_idempotent() {
    let node = node();
    let first = node.engine.create_or_update(&pod_with_init("web")).await.unwrap();
    let created = node.backend.created_count();
    let started = node.backend.start_count();

    let second = node.engine.create_or_update(&pod_with_init("web")).await.unwrap();

    assert_eq!(node.backend.created_count(), created);
    assert_eq!(node.backend.start_count(), started);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_update_recreates_changed_pod() {
    let node = node();
    node.engine.create_or_update(&pod_with_init("web")).await.unwrap();
    let old_id = node.backend.container("web.app").unwrap().id;

    let mut pod = pod_with_init("web");
    pod.spec.containers[0].image = "ubuntu:24.04".to_string();
    let updated = node.engine.create_or_update(&pod).await.unwrap();

    let app = node.backend.container("web.app").unwrap();
    assert_ne!(app.id, old_id);
    assert_eq!(app.image, "ubuntu:24.04");
    assert_eq!(updated.spec.containers[0].image, "ubuntu:24.04");
    assert_eq!(updated.status.phase, Some(PodPhase::Running));
}

#[tokio::test]
async fn test_crash_loop_reported_after_threshold() {
    let node = node();
    node.engine.create_or_update(&pod_with_init("web")).await.unwrap();

    node.backend.crash("web.app", 1, 2);
    let pod = node.engine.get(NAMESPACE, "web").await.unwrap();
    let app = &pod.status.container_statuses[0];
    assert_eq!(app.restart_count, 2);
    assert_eq!(
        app.state.terminated.as_ref().unwrap().reason.as_deref(),
        Some(reason::ERROR)
    );
    assert!(!holds(&pod, PodConditionType::Ready));

    node.backend.crash("web.app", 1, 3);
    let pod = node.engine.get(NAMESPACE, "web").await.unwrap();
    let app = &pod.status.container_statuses[0];
    assert_eq!(
        app.state.waiting.as_ref().unwrap().reason.as_deref(),
        Some(reason::CRASH_LOOP_BACK_OFF)
    );
    assert_eq!(app.last_state.terminated.as_ref().unwrap().exit_code, 1);
    assert_eq!(pod.status.phase, Some(PodPhase::Running));
}

#[tokio::test]
async fn test_failed_init_then_retry_converges() {
    let node = node();
    node.backend.fail_init("web.init", 1);

    let err = node
        .engine
        .create_or_update(&pod_with_init("web"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PodError::Backend(BackendError::DependencyFailed { exit_code: 1, .. })
    ));

    let pod = node.engine.get(NAMESPACE, "web").await.unwrap();
    assert_eq!(pod.status.phase, Some(PodPhase::Pending));
    assert!(!holds(&pod, PodConditionType::Initialized));
    let init = pod.status.init_container_statuses[0].state.terminated.as_ref().unwrap();
    assert_eq!(init.reason.as_deref(), Some(reason::INIT_ERROR));
    let app = pod.status.container_statuses[0].state.waiting.as_ref().unwrap();
    assert_eq!(app.reason.as_deref(), Some(reason::POD_INITIALIZING));

    node.backend.clear_init_failure("web.init");
    let pod = node.engine.create_or_update(&pod_with_init("web")).await.unwrap();
    assert_eq!(pod.status.phase, Some(PodPhase::Running));
    assert!(holds(&pod, PodConditionType::Ready));
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let node = node();
    node.engine.create_or_update(&nginx_pod("nginx")).await.unwrap();
    node.engine.create_or_update(&pod_with_init("web")).await.unwrap();

    node.engine.delete(&nginx_pod("nginx")).await.unwrap();

    let err = node.engine.get(NAMESPACE, "nginx").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(node.engine.get(NAMESPACE, "web").await.is_ok());

    let err = node.engine.delete(&nginx_pod("nginx")).await.unwrap_err();
    assert_eq!(err.reason_code(), "not_found");
}

#[tokio::test]
async fn test_list_returns_every_pod() {
    let node = node();
    node.engine.create_or_update(&nginx_pod("nginx")).await.unwrap();
    node.engine.create_or_update(&pod_with_init("web")).await.unwrap();

    let pods = node.engine.list().await.unwrap();
    let names: Vec<&str> = pods.iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["nginx", "web"]);
    assert!(pods.iter().all(|p| p.status.phase.is_some()));
}

#[tokio::test]
async fn test_changes_drain_once() {
    let node = node();
    node.engine.create_or_update(&pod_with_init("a")).await.unwrap();
    node.engine.create_or_update(&pod_with_init("b")).await.unwrap();

    node.engine.tracker().mark("a");
    node.engine.tracker().mark("b");
    node.engine.tracker().mark("a");

    let changed = node.engine.describe_changes().await.unwrap();
    let names: Vec<&str> = changed.iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["a", "b"]);

    assert!(node.engine.describe_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_pod_dropped_from_changes() {
    let node = node();
    node.engine.create_or_update(&pod_with_init("a")).await.unwrap();
    node.engine.delete(&pod_with_init("a")).await.unwrap();

    node.engine.tracker().mark("a");
    assert!(node.engine.describe_changes().await.unwrap().is_empty());
    assert_eq!(node.engine.tracker().pending(), 0);
}

#[tokio::test]
async fn test_tracker_follows_events_and_reconnects() {
    let node = node();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = node.engine.spawn_tracker(shutdown_rx);

    let backend = node.backend.clone();
    assert!(eventually(|| backend.subscription_count() == 1).await);

    node.engine.create_or_update(&pod_with_init("web")).await.unwrap();
    let tracker = node.engine.tracker().clone();
    assert!(eventually(|| tracker.pending() == 1).await);
    assert_eq!(tracker.drain(), vec!["web".to_string()]);

    // Events are lost while disconnected; the resync after reconnecting
    // marks every pod.
    node.backend.interrupt_events();
    assert!(eventually(|| backend.subscription_count() == 2).await);
    assert!(eventually(|| tracker.pending() == 1).await);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("tracker did not stop")
        .unwrap();
}
