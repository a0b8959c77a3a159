//! Container set to pod reconstruction.
//!
//! The pod is decoded from the label every container carries, then its status
//! is computed from the inspected containers. Nothing else is consulted.
//!
//! # State mapping
//!
//! | Container                         | Init unit              | Run unit                  |
//! |-----------------------------------|------------------------|---------------------------|
//! | running, not restarting           | Running, ready         | Running, ready            |
//! | created, never started            | Waiting                | Waiting                   |
//! | finished, exit 0                  | Terminated `Completed` | Terminated `Completed`    |
//! | finished, exit != 0               | Terminated `Init:Error`| Terminated `Error`        |
//! | restarts >= [`CRASH_LOOP_RESTARTS`] | as above             | Waiting `CrashLoopBackOff`|

use std::collections::HashMap;

use edge_podspec::{
    Container, ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
    Pod, PodCondition, PodConditionType, PodPhase, PodStatus,
};

use crate::backend::{RunStatus, RuntimeContainer};
use crate::error::PodError;
use crate::labels;

/// Restart count at which a run unit is reported as crash looping.
pub const CRASH_LOOP_RESTARTS: u32 = 3;

/// Container state reasons.
pub mod reason {
    pub const COMPLETED: &str = "Completed";
    pub const ERROR: &str = "Error";
    pub const INIT_ERROR: &str = "Init:Error";
    pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";
    pub const CONTAINER_CREATING: &str = "ContainerCreating";
    pub const POD_INITIALIZING: &str = "PodInitializing";
}

/// Rebuild a pod, with fresh status, from its containers.
///
/// `node_ip` is reported as both host and pod IP.
pub fn reconstruct(containers: &[RuntimeContainer], node_ip: Option<&str>) -> Result<Pod, PodError> {
    let first = containers.first().ok_or_else(|| PodError::Decode {
        pod: String::new(),
        reason: "no containers".to_string(),
    })?;
    let mut pod = decode_pod(first)?;

    let mut init_units: HashMap<&str, &RuntimeContainer> = HashMap::new();
    let mut run_units: HashMap<&str, &RuntimeContainer> = HashMap::new();
    for container in containers {
        let Some((_, unit)) = container
            .label(labels::SERVICE)
            .and_then(labels::parse_service_name)
        else {
            continue;
        };
        if container.label(labels::INIT_CONTAINER) == Some(labels::TRUE) {
            init_units.insert(unit, container);
        } else {
            run_units.insert(unit, container);
        }
    }

    let mut initialized = true;
    let mut init_container_statuses = Vec::with_capacity(pod.spec.init_containers.len());
    for spec in &pod.spec.init_containers {
        match init_units.get(spec.name.as_str()) {
            Some(container) => {
                let status = init_unit_status(spec, container);
                initialized &= status.ready;
                init_container_statuses.push(status);
            }
            None => initialized = false,
        }
    }

    let mut ready = initialized;
    let mut container_statuses = Vec::with_capacity(pod.spec.containers.len());
    for spec in &pod.spec.containers {
        match run_units.get(spec.name.as_str()) {
            Some(container) => {
                let status = run_unit_status(spec, container, initialized);
                ready &= status.ready;
                container_statuses.push(status);
            }
            None => ready = false,
        }
    }

    let phase = if initialized {
        PodPhase::Running
    } else {
        PodPhase::Pending
    };

    pod.status = PodStatus {
        phase: Some(phase),
        conditions: vec![
            PodCondition::new(PodConditionType::Initialized, initialized),
            PodCondition::new(PodConditionType::Ready, ready),
            PodCondition::new(PodConditionType::PodScheduled, true),
        ],
        host_ip: node_ip.map(str::to_string),
        pod_ip: node_ip.map(str::to_string),
        init_container_statuses,
        container_statuses,
        ..Default::default()
    };

    Ok(pod)
}

/// Decode the pod embedded in a container's labels.
pub fn decode_pod(container: &RuntimeContainer) -> Result<Pod, PodError> {
    let pod_name = container
        .label(labels::POD_NAME)
        .unwrap_or(container.name.as_str())
        .to_string();

    let raw = container.label(labels::POD_INFO).ok_or_else(|| PodError::Decode {
        pod: pod_name.clone(),
        reason: format!("container {} has no {} label", container.id, labels::POD_INFO),
    })?;

    serde_json::from_str(raw).map_err(|e| PodError::Decode {
        pod: pod_name,
        reason: e.to_string(),
    })
}

fn init_unit_status(spec: &Container, container: &RuntimeContainer) -> ContainerStatus {
    let mut status = base_status(spec, container);
    let state = &container.state;

    if state.running && !state.restarting {
        status.state = ContainerState::running(state.started_at.or(container.created));
        status.ready = true;
        return status;
    }
    if state.status == RunStatus::Created {
        status.state = ContainerState::waiting(reason::CONTAINER_CREATING);
        return status;
    }

    let succeeded = state.exit_code == 0;
    let mut terminated = terminated(container, reason::COMPLETED);
    if !succeeded {
        terminated.reason = Some(reason::INIT_ERROR.to_string());
        terminated.message = Some(state.error.clone()).filter(|m| !m.is_empty());
    }
    status.state = ContainerState::terminated(terminated);
    status.ready = succeeded;
    status
}

fn run_unit_status(
    spec: &Container,
    container: &RuntimeContainer,
    initialized: bool,
) -> ContainerStatus {
    let mut status = base_status(spec, container);
    let state = &container.state;

    if state.running && !state.restarting {
        status.state = ContainerState::running(state.started_at.or(container.created));
        status.ready = true;
        return status;
    }
    if state.status == RunStatus::Created {
        let waiting_for = if initialized {
            reason::CONTAINER_CREATING
        } else {
            reason::POD_INITIALIZING
        };
        status.state = ContainerState::waiting(waiting_for);
        return status;
    }

    let reason = if state.exit_code == 0 {
        reason::COMPLETED
    } else {
        reason::ERROR
    };
    let terminated = terminated(container, reason);

    if container.restart_count >= CRASH_LOOP_RESTARTS {
        status.state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason::CRASH_LOOP_BACK_OFF.to_string()),
                message: Some(format!(
                    "back-off restarting failed container {} after {} restarts",
                    spec.name, container.restart_count
                )),
            }),
            ..Default::default()
        };
        status.last_state = ContainerState::terminated(terminated);
    } else {
        status.state = ContainerState::terminated(terminated);
    }
    status
}

fn base_status(spec: &Container, container: &RuntimeContainer) -> ContainerStatus {
    let image = if container.image.is_empty() {
        spec.image.clone()
    } else {
        container.image.clone()
    };

    ContainerStatus {
        name: spec.name.clone(),
        image,
        container_id: Some(format!("docker://{}", container.id)),
        ready: false,
        restart_count: container.restart_count,
        ..Default::default()
    }
}

fn terminated(container: &RuntimeContainer, reason: &str) -> ContainerStateTerminated {
    ContainerStateTerminated {
        exit_code: container.state.exit_code,
        reason: Some(reason.to_string()),
        message: None,
        started_at: container.state.started_at,
        finished_at: container.state.finished_at,
    }
}
