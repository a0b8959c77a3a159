//! Per-service apply decisions shared by the backends.

use std::collections::HashSet;

use edge_reconcile::{classify, ConvergenceStatus, SpecHash};

use super::{BackendError, RunStatus};
use crate::project::{ApplyPolicy, Recreate, RestartPolicy, ServiceUnit};

/// Decision for one planned service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServicePlan {
    /// Hash to stamp on a newly created container.
    pub hash: SpecHash,
    pub status: ConvergenceStatus,
}

/// Decide whether the existing container of `service` (if any) is kept.
///
/// `recreated` holds services already recreated during this apply: a service
/// sharing the network namespace of one of them must follow it.
pub(crate) fn plan_service(
    service: &ServiceUnit,
    current_hash: Option<&str>,
    policy: ApplyPolicy,
    recreated: &HashSet<String>,
) -> Result<ServicePlan, BackendError> {
    let hash = service.config_hash()?;
    let current = current_hash.map(SpecHash::from_stored);

    let mut status = with_policy(classify(current.as_ref(), &hash), policy.recreate);
    let provider_recreated = service
        .network_mode
        .shared_service()
        .is_some_and(|provider| recreated.contains(provider));
    if status == ConvergenceStatus::Converged && provider_recreated {
        status = with_policy(ConvergenceStatus::Diverged, policy.recreate_dependents);
    }

    Ok(ServicePlan { hash, status })
}

fn with_policy(status: ConvergenceStatus, recreate: Recreate) -> ConvergenceStatus {
    match (status, recreate) {
        (ConvergenceStatus::Missing, _) => ConvergenceStatus::Missing,
        (_, Recreate::Never) => ConvergenceStatus::Converged,
        (status, Recreate::Diverged) => status,
    }
}

/// Whether a kept container must be started again.
///
/// Containers that never started are started; run units are restarted when
/// they are down. An init unit that finished with `exit_code` zero stays
/// finished, any other outcome (including an unknown one) runs it again.
pub(crate) fn needs_start(service: &ServiceUnit, status: RunStatus, exit_code: Option<i32>) -> bool {
    match status {
        RunStatus::Created => true,
        RunStatus::Running | RunStatus::Restarting | RunStatus::Paused | RunStatus::Removing => {
            false
        }
        RunStatus::Exited | RunStatus::Dead => {
            service.restart == RestartPolicy::Always || exit_code != Some(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::project::{NetworkMode, PullPolicy};

    fn unit(name: &str, restart: RestartPolicy, network_mode: NetworkMode) -> ServiceUnit {
        ServiceUnit {
            name: name.to_string(),
            image: "busybox".to_string(),
            command: vec![],
            working_dir: None,
            environment: BTreeMap::new(),
            labels: BTreeMap::new(),
            restart,
            scale: 1,
            ports: vec![],
            volumes: vec![],
            networks: BTreeMap::new(),
            network_mode,
            depends_on: BTreeMap::new(),
            privileged: false,
            tty: true,
            pull_policy: PullPolicy::IfNotPresent,
        }
    }

    #[test]
    fn test_plan_converged_and_diverged() {
        let app = unit("web.app", RestartPolicy::Always, NetworkMode::Bridge);
        let hash = app.config_hash().unwrap();
        let none = HashSet::new();

        let plan = plan_service(&app, Some(hash.as_str()), ApplyPolicy::converge(), &none).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Converged);

        let plan = plan_service(&app, Some("stale"), ApplyPolicy::converge(), &none).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Diverged);

        let plan = plan_service(&app, None, ApplyPolicy::converge(), &none).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Missing);
        assert_eq!(plan.hash, hash);
    }

    #[test]
    fn test_namespace_sharer_follows_provider() {
        let side = unit(
            "web.side",
            RestartPolicy::Always,
            NetworkMode::Service("web.app".to_string()),
        );
        let hash = side.config_hash().unwrap();
        let recreated = HashSet::from(["web.app".to_string()]);

        let plan =
            plan_service(&side, Some(hash.as_str()), ApplyPolicy::converge(), &recreated).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Diverged);

        let policy = ApplyPolicy {
            recreate_dependents: Recreate::Never,
            ..ApplyPolicy::converge()
        };
        let plan = plan_service(&side, Some(hash.as_str()), policy, &recreated).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Converged);
    }

    #[test]
    fn test_never_recreate_keeps_diverged() {
        let app = unit("web.app", RestartPolicy::Always, NetworkMode::Bridge);
        let policy = ApplyPolicy {
            recreate: Recreate::Never,
            ..ApplyPolicy::converge()
        };

        let plan = plan_service(&app, Some("stale"), policy, &HashSet::new()).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Converged);

        let plan = plan_service(&app, None, policy, &HashSet::new()).unwrap();
        assert_eq!(plan.status, ConvergenceStatus::Missing);
    }

    #[test]
    fn test_needs_start() {
        let init = unit("web.init", RestartPolicy::No, NetworkMode::Bridge);
        let app = unit("web.app", RestartPolicy::Always, NetworkMode::Bridge);

        assert!(needs_start(&init, RunStatus::Created, None));
        assert!(!needs_start(&init, RunStatus::Exited, Some(0)));
        assert!(needs_start(&init, RunStatus::Exited, Some(2)));
        assert!(needs_start(&init, RunStatus::Dead, None));
        assert!(needs_start(&app, RunStatus::Exited, Some(0)));
        assert!(!needs_start(&app, RunStatus::Running, None));
        assert!(!needs_start(&app, RunStatus::Restarting, None));
    }
}
