//! Pod to service set translation.
//!
//! Turns one pod into a [`Project`]: an ordered list of services carrying the
//! labels, mounts, network placement and dependency edges that make the
//! engine run the pod the way the pod contract expects.
//!
//! # Invariants
//!
//! - Init units form a completion chain, and every run unit waits for every
//!   init unit
//! - Every service embeds the pod (status cleared) in [`labels::POD_INFO`]
//! - Translation never fails for a pod that passes validation; volume kinds
//!   the node cannot provide are skipped

use std::collections::BTreeMap;
use std::path::PathBuf;

use edge_podspec::{validate, Container, Pod, VolumeKind};
use tracing::debug;

use crate::config::VolumeRoots;
use crate::error::PodError;
use crate::labels;
use crate::project::{
    BindMount, DependencyCondition, NetworkDef, NetworkMode, PortBinding, Project, PullPolicy,
    RestartPolicy, ServiceNetwork, ServiceUnit,
};

/// Translate a pod into the service set that realizes it.
pub fn translate(pod: &Pod, project: &str, roots: &VolumeRoots) -> Result<Project, PodError> {
    validate(pod)?;

    let pod_info =
        serde_json::to_string(&pod.without_status()).map_err(|source| PodError::Encode {
            pod: pod.key(),
            source,
        })?;
    let common = common_labels(pod, project, pod_info);
    let host_network = pod.spec.host_network;

    let init_names: Vec<String> = pod
        .spec
        .init_containers
        .iter()
        .map(|c| labels::service_name(pod.name(), &c.name))
        .collect();

    let mut services = Vec::with_capacity(init_names.len() + pod.spec.containers.len());

    for (index, container) in pod.spec.init_containers.iter().enumerate() {
        let mut depends_on = BTreeMap::new();
        if let Some(previous) = index.checked_sub(1).and_then(|i| init_names.get(i)) {
            depends_on.insert(previous.clone(), DependencyCondition::CompletedSuccessfully);
        }

        let (network_mode, networks) = if host_network {
            (NetworkMode::Host, BTreeMap::new())
        } else {
            (NetworkMode::Bridge, default_network(Vec::new()))
        };

        services.push(service(
            pod,
            container,
            &common,
            roots,
            Unit {
                init: true,
                depends_on,
                network_mode,
                networks,
            },
        ));
    }

    let mut first_run: Option<String> = None;
    for container in &pod.spec.containers {
        let depends_on: BTreeMap<_, _> = init_names
            .iter()
            .map(|name| (name.clone(), DependencyCondition::CompletedSuccessfully))
            .collect();

        let (network_mode, networks) = match (&first_run, host_network) {
            (_, true) => (NetworkMode::Host, BTreeMap::new()),
            (None, false) => (NetworkMode::Bridge, default_network(aliases(pod))),
            (Some(first), false) => (NetworkMode::Service(first.clone()), BTreeMap::new()),
        };

        let unit = service(
            pod,
            container,
            &common,
            roots,
            Unit {
                init: false,
                depends_on,
                network_mode,
                networks,
            },
        );
        if first_run.is_none() {
            first_run = Some(unit.name.clone());
        }
        services.push(unit);
    }

    let mut networks = BTreeMap::new();
    if !host_network {
        networks.insert(
            labels::DEFAULT_NETWORK.to_string(),
            NetworkDef {
                name: labels::network_name(project),
                labels: BTreeMap::from([(labels::PROJECT.to_string(), project.to_string())]),
            },
        );
    }

    Ok(Project {
        name: project.to_string(),
        services,
        networks,
    })
}

/// Service names of every unit of the pod, init units first.
///
/// Needs only unit names, so it works for pods that no longer validate.
pub fn service_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .init_containers
        .iter()
        .chain(pod.spec.containers.iter())
        .map(|c| labels::service_name(pod.name(), &c.name))
        .collect()
}

struct Unit {
    init: bool,
    depends_on: BTreeMap<String, DependencyCondition>,
    network_mode: NetworkMode,
    networks: BTreeMap<String, ServiceNetwork>,
}

fn service(
    pod: &Pod,
    container: &Container,
    common: &BTreeMap<String, String>,
    roots: &VolumeRoots,
    unit: Unit,
) -> ServiceUnit {
    let name = labels::service_name(pod.name(), &container.name);

    let mut unit_labels = common.clone();
    unit_labels.insert(labels::SERVICE.to_string(), name.clone());
    if unit.init {
        unit_labels.insert(labels::INIT_CONTAINER.to_string(), labels::TRUE.to_string());
    }

    let environment = container
        .env
        .iter()
        .filter_map(|var| {
            if var.is_reference() {
                debug!(
                    pod = %pod.key(),
                    container = %container.name,
                    variable = %var.name,
                    "Skipping environment variable without a literal value"
                );
                return None;
            }
            Some((var.name.clone(), var.value.clone().unwrap_or_default()))
        })
        .collect();

    let ports = container
        .ports
        .iter()
        .map(|port| PortBinding {
            target: port.container_port,
            published: port.host_port,
            protocol: port.protocol,
            host_ip: port.host_ip.clone(),
        })
        .collect();

    ServiceUnit {
        name,
        image: container.image.clone(),
        command: container
            .command
            .iter()
            .chain(container.args.iter())
            .cloned()
            .collect(),
        working_dir: container.working_dir.clone(),
        environment,
        labels: unit_labels,
        restart: if unit.init {
            RestartPolicy::No
        } else {
            RestartPolicy::Always
        },
        scale: 1,
        ports,
        volumes: bind_mounts(pod, container, roots),
        networks: unit.networks,
        network_mode: unit.network_mode,
        depends_on: unit.depends_on,
        privileged: container.privileged(),
        tty: true,
        pull_policy: PullPolicy::from_pod(container.image_pull_policy.as_deref()),
    }
}

fn common_labels(pod: &Pod, project: &str, pod_info: String) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::PROJECT.to_string(), project.to_string()),
        (labels::ONEOFF.to_string(), labels::ONEOFF_FALSE.to_string()),
        (labels::NAMESPACE.to_string(), pod.namespace().to_string()),
        (labels::POD_NAME.to_string(), pod.name().to_string()),
        (labels::POD_INFO.to_string(), pod_info),
    ])
}

fn default_network(aliases: Vec<String>) -> BTreeMap<String, ServiceNetwork> {
    BTreeMap::from([(labels::DEFAULT_NETWORK.to_string(), ServiceNetwork { aliases })])
}

/// Stable names peers can reach the pod by: the app label, else the owner.
fn aliases(pod: &Pod) -> Vec<String> {
    let from_label = labels::APP_LABELS
        .iter()
        .find_map(|key| pod.metadata.labels.get(*key))
        .filter(|value| !value.is_empty());
    if let Some(app) = from_label {
        return vec![app.clone()];
    }

    pod.metadata
        .owner_references
        .first()
        .map(|owner| owner.name.clone())
        .filter(|name| !name.is_empty())
        .into_iter()
        .collect()
}

fn bind_mounts(pod: &Pod, container: &Container, roots: &VolumeRoots) -> Vec<BindMount> {
    let mut mounts = Vec::with_capacity(container.volume_mounts.len());

    for mount in &container.volume_mounts {
        let Some(volume) = pod.volume(&mount.name) else {
            continue;
        };

        let scoped = |root: &PathBuf| root.join(pod.namespace()).join(&volume.name);
        let mut source = match volume.kind() {
            VolumeKind::HostPath(path) if !path.is_empty() => PathBuf::from(path),
            VolumeKind::EmptyDir => scoped(&roots.empty_dir),
            VolumeKind::ConfigMap => scoped(&roots.config_map),
            VolumeKind::Secret => scoped(&roots.secret),
            VolumeKind::HostPath(_) | VolumeKind::Unsupported => {
                debug!(
                    pod = %pod.key(),
                    container = %container.name,
                    volume = %volume.name,
                    "Skipping mount of unsupported volume"
                );
                continue;
            }
        };

        if let Some(sub_path) = mount.sub_path.as_deref().filter(|p| !p.is_empty()) {
            source = source.join(sub_path);
        }

        mounts.push(BindMount {
            source,
            target: mount.mount_path.clone(),
            read_only: mount.read_only,
        });
    }

    mounts
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use edge_podspec::{EnvVar, SpecError, Volume};
    use edge_testing::{container, mount, nginx_pod, pod, pod_with_init};

    use super::*;

    fn roots() -> VolumeRoots {
        VolumeRoots::under(Path::new("/var/lib/edgelet"))
    }

    #[test]
    fn test_init_pod_layout() {
        let project = translate(&pod_with_init("web"), "edge", &roots()).unwrap();

        assert_eq!(project.service_names(), vec!["web.init", "web.app"]);

        let init = project.service("web.init").unwrap();
        assert!(init.is_init());
        assert_eq!(init.restart, RestartPolicy::No);
        assert!(init.depends_on.is_empty());
        assert_eq!(init.command, vec!["sleep", "1"]);

        let app = project.service("web.app").unwrap();
        assert!(!app.is_init());
        assert_eq!(app.restart, RestartPolicy::Always);
        assert_eq!(
            app.depends_on.get("web.init"),
            Some(&DependencyCondition::CompletedSuccessfully)
        );
        assert_eq!(app.ports[0].target, 80);
        assert_eq!(app.ports[0].published, Some(8080));
        assert_eq!(app.scale, 1);
        assert!(app.tty);

        let network = project.networks.get(labels::DEFAULT_NETWORK).unwrap();
        assert_eq!(network.name, "edge_default");
    }

    #[test]
    fn test_labels_embed_pod_without_status() {
        let mut input = pod_with_init("web");
        input.status.host_ip = Some("10.0.0.9".to_string());

        let project = translate(&input, "edge", &roots()).unwrap();
        for unit in &project.services {
            assert_eq!(unit.labels[labels::PROJECT], "edge");
            assert_eq!(unit.labels[labels::SERVICE], unit.name);
            assert_eq!(unit.labels[labels::ONEOFF], "False");
            assert_eq!(unit.labels[labels::NAMESPACE], "default");
            assert_eq!(unit.labels[labels::POD_NAME], "web");

            let embedded: Pod = serde_json::from_str(&unit.labels[labels::POD_INFO]).unwrap();
            assert_eq!(embedded, input.without_status());
        }
    }

    #[test]
    fn test_init_chain() {
        let mut input = pod("batch");
        for name in ["fetch", "migrate", "warm"] {
            input
                .spec
                .init_containers
                .push(container(name, "busybox", &["true"]));
        }
        input.spec.containers.push(container("main", "busybox", &[]));
        input.spec.containers.push(container("side", "busybox", &[]));

        let project = translate(&input, "edge", &roots()).unwrap();

        let migrate = project.service("batch.migrate").unwrap();
        assert_eq!(migrate.depends_on.keys().collect::<Vec<_>>(), vec!["batch.fetch"]);
        let warm = project.service("batch.warm").unwrap();
        assert_eq!(warm.depends_on.keys().collect::<Vec<_>>(), vec!["batch.migrate"]);

        for run in ["batch.main", "batch.side"] {
            let unit = project.service(run).unwrap();
            assert_eq!(unit.completion_dependencies().count(), 3);
        }
    }

    #[test]
    fn test_network_placement_and_aliases() {
        let project = translate(&nginx_pod("nginx-x1"), "edge", &roots()).unwrap();

        let web = project.service("nginx-x1.web").unwrap();
        assert_eq!(web.network_mode, NetworkMode::Bridge);
        assert_eq!(web.networks[labels::DEFAULT_NETWORK].aliases, vec!["nginx"]);

        let exporter = project.service("nginx-x1.exporter").unwrap();
        assert_eq!(
            exporter.network_mode,
            NetworkMode::Service("nginx-x1.web".to_string())
        );
        assert!(exporter.networks.is_empty());
        assert_eq!(
            exporter.command,
            vec!["-nginx.scrape-uri=http://localhost:80/stub_status"]
        );
    }

    #[test]
    fn test_alias_falls_back_to_owner() {
        let mut input = nginx_pod("nginx-x1");
        input.metadata.labels.clear();

        let project = translate(&input, "edge", &roots()).unwrap();
        let web = project.service("nginx-x1.web").unwrap();
        assert_eq!(
            web.networks[labels::DEFAULT_NETWORK].aliases,
            vec!["nginx-deployment"]
        );
    }

    #[test]
    fn test_host_network() {
        let mut input = nginx_pod("nginx-x1");
        input.spec.host_network = true;

        let project = translate(&input, "edge", &roots()).unwrap();
        assert!(project.networks.is_empty());
        for unit in &project.services {
            assert_eq!(unit.network_mode, NetworkMode::Host);
            assert!(unit.networks.is_empty());
        }
    }

    #[test]
    fn test_volume_resolution() {
        let data = tempfile::tempdir().unwrap();
        let roots = VolumeRoots::under(data.path());
        let project = translate(&nginx_pod("nginx-x1"), "edge", &roots).unwrap();

        let web = project.service("nginx-x1.web").unwrap();
        let sources: Vec<_> = web.volumes.iter().map(|m| m.source.clone()).collect();
        assert_eq!(
            sources,
            vec![
                PathBuf::from("/var/log/nginx"),
                data.path().join("emptydir/default/cache"),
                data.path().join("configmap/default/conf/nginx.conf"),
                data.path().join("secret/default/tls"),
            ]
        );
        assert!(web.volumes[2].read_only);
        assert_eq!(web.volumes[2].target, "/etc/nginx/nginx.conf");
        assert_eq!(web.environment["NGINX_PORT"], "80");
    }

    #[test]
    fn test_unsupported_volume_is_skipped() {
        let mut input = pod("tok");
        input.spec.volumes.push(Volume {
            name: "token".to_string(),
            other: BTreeMap::from([("projected".to_string(), serde_json::json!({}))]),
            ..Default::default()
        });
        let mut app = container("app", "busybox", &[]);
        app.volume_mounts.push(mount("token", "/var/run/token"));
        input.spec.containers.push(app);

        let project = translate(&input, "edge", &roots()).unwrap();
        assert!(project.services[0].volumes.is_empty());
    }

    #[test]
    fn test_referenced_env_is_skipped() {
        let mut input = pod("env");
        let mut app = container("app", "busybox", &[]);
        app.env.push(EnvVar::literal("MODE", "edge"));
        app.env.push(EnvVar {
            name: "EMPTY".to_string(),
            ..Default::default()
        });
        app.env.push(EnvVar {
            name: "POD_IP".to_string(),
            value_from: Some(serde_json::json!({"fieldRef": {"fieldPath": "status.podIP"}})),
            ..Default::default()
        });
        input.spec.containers.push(app);

        let project = translate(&input, "edge", &roots()).unwrap();
        let environment = &project.services[0].environment;
        assert_eq!(environment.get("MODE").map(String::as_str), Some("edge"));
        assert_eq!(environment.get("EMPTY").map(String::as_str), Some(""));
        assert!(!environment.contains_key("POD_IP"));

        let embedded: Pod =
            serde_json::from_str(&project.services[0].labels[labels::POD_INFO]).unwrap();
        assert!(embedded.spec.containers[0].env[2].is_reference());
    }

    #[test]
    fn test_embedded_pod_keeps_unmodelled_fields() {
        let input: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "tolerations": [{"key": "edge", "operator": "Exists"}],
                "containers": [{
                    "name": "app",
                    "image": "nginx",
                    "resources": {"limits": {"memory": "64Mi"}},
                    "livenessProbe": {"tcpSocket": {"port": 80}}
                }]
            }
        }))
        .unwrap();

        let project = translate(&input, "edge", &roots()).unwrap();
        let embedded: serde_json::Value =
            serde_json::from_str(&project.services[0].labels[labels::POD_INFO]).unwrap();
        assert_eq!(
            embedded["spec"]["tolerations"],
            serde_json::json!([{"key": "edge", "operator": "Exists"}])
        );
        let app = &embedded["spec"]["containers"][0];
        assert_eq!(app["resources"]["limits"]["memory"], "64Mi");
        assert_eq!(app["livenessProbe"]["tcpSocket"]["port"], 80);
    }

    #[test]
    fn test_invalid_pod_rejected() {
        let mut input = pod("dup");
        input.spec.init_containers.push(container("app", "busybox", &[]));
        input.spec.containers.push(container("app", "busybox", &[]));

        let err = translate(&input, "edge", &roots()).unwrap_err();
        assert!(matches!(
            err,
            PodError::InvalidSpec(SpecError::DuplicateUnit { .. })
        ));
    }

    #[test]
    fn test_service_names_without_validation() {
        let mut input = pod("web.blue");
        input.spec.init_containers.push(container("init", "", &[]));
        input.spec.containers.push(container("app", "", &[]));
        assert_eq!(service_names(&input), vec!["web.blue.init", "web.blue.app"]);
    }

    #[test]
    fn test_translation_is_deterministic() {
        let a = translate(&nginx_pod("n"), "edge", &roots()).unwrap();
        let b = translate(&nginx_pod("n"), "edge", &roots()).unwrap();
        for (x, y) in a.services.iter().zip(&b.services) {
            assert_eq!(x.config_hash().unwrap(), y.config_hash().unwrap());
        }
    }
}
