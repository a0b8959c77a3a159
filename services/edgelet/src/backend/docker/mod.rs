//! Docker Engine backend.
//!
//! Applies projects with compose semantics directly against the Engine API:
//! containers are named `{project}-{service}-1`, carry the compose labels and
//! a config hash, and are only recreated when that hash changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::DateTime;
use edge_reconcile::{ConvergenceStatus, SpecHash};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::plan::{needs_start, plan_service};
use super::{
    BackendError, ContainerBackend, ContainerFilter, ContainerSummary, EventStream, LogOptions,
    LogStream, RunStatus, RuntimeContainer,
};
use crate::labels;
use crate::project::{
    ApplyPolicy, NetworkDef, NetworkMode, Project, PullPolicy, ServiceUnit,
};

mod client;
mod models;
mod stream;

use client::{is_missing, query, EngineClient};
use models::{
    ContainerInspect, ContainerListEntry, CreateContainer, CreateNetwork, CreateResponse, Empty,
    EndpointSettings, HostConfig, HostPort, NetworkingConfig, RestartPolicySpec, WaitResponse,
};

/// Seconds a container gets to stop before it is killed.
const STOP_TIMEOUT_SECS: &str = "10";

/// Backend speaking to a local Docker Engine.
pub struct DockerBackend {
    client: EngineClient,
}

impl DockerBackend {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            client: EngineClient::new(socket_path),
        }
    }

    /// Check if the engine socket exists.
    pub fn socket_exists(&self) -> bool {
        self.client.socket_exists()
    }

    async fn ensure_network(&self, network: &NetworkDef) -> Result<(), BackendError> {
        let path = format!("/networks/{}", network.name);
        match self.client.get::<serde_json::Value>(&path).await {
            Ok(_) => return Ok(()),
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e),
        }

        info!(network = %network.name, "Creating network");
        let body = CreateNetwork {
            name: network.name.clone(),
            driver: "bridge".to_string(),
            labels: network.labels.clone(),
            check_duplicate: true,
        };
        let _: serde_json::Value = self.client.post("/networks/create", &body).await?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), BackendError> {
        let (name, tag) = split_image_ref(image);
        let mut params = vec![("fromImage", name)];
        if let Some(tag) = tag {
            params.push(("tag", tag));
        }

        info!(image = %image, "Pulling image");
        let body = self
            .client
            .post_stream(&format!("/images/create?{}", query(&params)))
            .await?;

        // Pull failures arrive in-band as `{"error": ...}` lines.
        let mut progress = Box::pin(stream::json_lines::<serde_json::Value>(body));
        while let Some(line) = progress.next().await {
            if let Some(message) = line?.get("error").and_then(|e| e.as_str()) {
                return Err(BackendError::Api {
                    status: 500,
                    message: format!("pull {image}: {message}"),
                });
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        project: &Project,
        service: &ServiceUnit,
        hash: &SpecHash,
        ids: &HashMap<String, String>,
    ) -> Result<String, BackendError> {
        let body = create_body(project, service, hash, ids)?;
        let name = format!("{}-{}-1", project.name, service.name);
        let path = format!("/containers/create?{}", query(&[("name", name.as_str())]));

        if service.pull_policy == PullPolicy::Always {
            self.pull(&service.image).await?;
        }

        let created: CreateResponse = match self.client.post(&path, &body).await {
            Err(e) if is_missing(&e) && service.pull_policy != PullPolicy::Never => {
                self.pull(&service.image).await?;
                self.client.post(&path, &body).await?
            }
            other => other?,
        };

        for warning in created.warnings.unwrap_or_default() {
            warn!(service = %service.name, warning = %warning, "Engine warning on create");
        }
        debug!(service = %service.name, id = %created.id, "Created container");
        Ok(created.id)
    }

    async fn start(&self, service: &ServiceUnit, id: &str) -> Result<(), BackendError> {
        debug!(service = %service.name, id = %id, "Starting container");
        self.client
            .post_empty(&format!("/containers/{id}/start"))
            .await
    }

    /// Stop (gracefully) and remove a container. Already gone is fine.
    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        let stop = format!(
            "/containers/{id}/stop?{}",
            query(&[("t", STOP_TIMEOUT_SECS)])
        );
        match self.client.post_empty(&stop).await {
            Ok(()) => {}
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(e),
        }

        let delete = format!(
            "/containers/{id}?{}",
            query(&[("force", "true"), ("v", "true")])
        );
        match self.client.delete(&delete).await {
            Err(e) if is_missing(&e) => Ok(()),
            other => other,
        }
    }

    /// Block until every completion dependency of `service` has exited 0.
    async fn wait_for_dependencies(
        &self,
        service: &ServiceUnit,
        ids: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        for dependency in service.completion_dependencies() {
            let id = ids
                .get(dependency)
                .ok_or_else(|| BackendError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dependency.to_string(),
                })?;

            debug!(service = %service.name, dependency = %dependency, "Waiting for dependency");
            let path = format!(
                "/containers/{id}/wait?{}",
                query(&[("condition", "not-running")])
            );
            let outcome: WaitResponse = self.client.post_for(&path).await?;

            if let Some(error) = outcome.error.filter(|e| !e.message.is_empty()) {
                warn!(dependency = %dependency, error = %error.message, "Dependency wait reported an error");
            }
            if outcome.status_code != 0 {
                return Err(BackendError::DependencyFailed {
                    service: service.name.clone(),
                    dependency: dependency.to_string(),
                    exit_code: i32::try_from(outcome.status_code).unwrap_or(i32::MAX),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, BackendError> {
        let filters = serde_json::json!({ "label": filter.label_args() }).to_string();
        let path = format!(
            "/containers/json?{}",
            query(&[("all", "1"), ("filters", filters.as_str())])
        );
        let entries: Vec<ContainerListEntry> = self.client.get(&path).await?;
        Ok(entries.into_iter().map(ContainerSummary::from).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, BackendError> {
        match self
            .client
            .get::<ContainerInspect>(&format!("/containers/{id}/json"))
            .await
        {
            Ok(inspect) => Ok(RuntimeContainer::from(inspect)),
            Err(e) if is_missing(&e) => Err(BackendError::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, project: &Project, policy: ApplyPolicy) -> Result<(), BackendError> {
        for network in project.networks.values() {
            self.ensure_network(network).await?;
        }

        let mut ids: HashMap<String, String> = HashMap::new();
        let mut recreated = HashSet::new();
        let mut to_start: Vec<(&ServiceUnit, String)> = Vec::new();

        // Create everything first so status reads see the whole pod.
        for service in &project.services {
            let mut existing = self
                .list_containers(&labels::service_filter(&project.name, &service.name))
                .await?
                .into_iter();
            let current = existing.next();
            for extra in existing {
                warn!(service = %service.name, id = %extra.id, "Removing surplus container");
                self.remove(&extra.id).await?;
            }

            let plan = plan_service(
                service,
                current.as_ref().and_then(|c| c.label(labels::CONFIG_HASH)),
                policy,
                &recreated,
            )?;

            match (plan.status, current) {
                (ConvergenceStatus::Converged, Some(container)) => {
                    let status = RunStatus::parse(&container.state);
                    let exit_code = match status {
                        RunStatus::Exited | RunStatus::Dead => Some(
                            self.inspect_container(&container.id)
                                .await?
                                .state
                                .exit_code,
                        ),
                        _ => None,
                    };
                    if needs_start(service, status, exit_code) {
                        to_start.push((service, container.id.clone()));
                    }
                    ids.insert(service.name.clone(), container.id);
                }
                (status, current) => {
                    if let Some(container) = current {
                        info!(service = %service.name, ?status, "Recreating container");
                        self.remove(&container.id).await?;
                    }
                    let id = self.create(project, service, &plan.hash, &ids).await?;
                    recreated.insert(service.name.clone());
                    ids.insert(service.name.clone(), id.clone());
                    to_start.push((service, id));
                }
            }
        }

        for (service, id) in to_start {
            self.wait_for_dependencies(service, &ids).await?;
            self.start(service, &id).await?;
        }

        Ok(())
    }

    async fn teardown(&self, project: &str, services: &[String]) -> Result<(), BackendError> {
        for service in services {
            let containers = self
                .list_containers(&labels::service_filter(project, service))
                .await?;
            for container in containers {
                info!(service = %service, id = %container.id, "Removing container");
                self.remove(&container.id).await?;
            }
        }
        Ok(())
    }

    async fn events(&self, filter: &ContainerFilter) -> Result<EventStream, BackendError> {
        let filters = serde_json::json!({
            "label": filter.label_args(),
            "type": ["container"],
        })
        .to_string();
        let body = self
            .client
            .get_stream(&format!("/events?{}", query(&[("filters", filters.as_str())])))
            .await?;
        Ok(stream::events(body))
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, BackendError> {
        let since = options.since.as_deref().map(since_param);
        let tail = options.tail.to_string();

        let mut params = vec![("stdout", "1"), ("stderr", "1")];
        if options.follow {
            params.push(("follow", "1"));
        }
        if options.timestamps {
            params.push(("timestamps", "1"));
        }
        if let Some(since) = since.as_deref() {
            params.push(("since", since));
        }
        if options.tail > 0 {
            params.push(("tail", tail.as_str()));
        }

        match self
            .client
            .get_stream(&format!("/containers/{id}/logs?{}", query(&params)))
            .await
        {
            Ok(body) => Ok(stream::bytes(body)),
            Err(e) if is_missing(&e) => Err(BackendError::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }
}

fn create_body(
    project: &Project,
    service: &ServiceUnit,
    hash: &SpecHash,
    ids: &HashMap<String, String>,
) -> Result<CreateContainer, BackendError> {
    let mut container_labels = service.labels.clone();
    container_labels.insert(labels::CONFIG_HASH.to_string(), hash.to_string());
    container_labels.insert(labels::CONTAINER_NUMBER.to_string(), "1".to_string());

    let mut exposed_ports = BTreeMap::new();
    let mut port_bindings: BTreeMap<String, Vec<HostPort>> = BTreeMap::new();
    for port in &service.ports {
        let key = port.port_key();
        exposed_ports.insert(key.clone(), Empty {});
        if let Some(published) = port.published {
            port_bindings.entry(key).or_default().push(HostPort {
                host_ip: port.host_ip.clone().unwrap_or_default(),
                host_port: published.to_string(),
            });
        }
    }

    let mut endpoints = BTreeMap::new();
    for (key, attachment) in &service.networks {
        let name = project
            .networks
            .get(key)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| key.clone());
        endpoints.insert(
            name,
            EndpointSettings {
                aliases: attachment.aliases.clone(),
            },
        );
    }

    let network_mode = match &service.network_mode {
        NetworkMode::Host => "host".to_string(),
        NetworkMode::Bridge => endpoints
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "bridge".to_string()),
        NetworkMode::Service(provider) => {
            let id = ids
                .get(provider)
                .ok_or_else(|| BackendError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: provider.clone(),
                })?;
            format!("container:{id}")
        }
    };

    Ok(CreateContainer {
        image: service.image.clone(),
        cmd: service.command.clone(),
        env: service
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect(),
        labels: container_labels,
        tty: service.tty,
        working_dir: service.working_dir.clone(),
        exposed_ports,
        host_config: HostConfig {
            binds: service.volumes.iter().map(|m| m.bind_spec()).collect(),
            port_bindings,
            restart_policy: RestartPolicySpec {
                name: service.restart.as_engine_str().to_string(),
            },
            network_mode,
            privileged: service.privileged,
        },
        networking_config: NetworkingConfig {
            endpoints_config: endpoints,
        },
    })
}

/// Split an image reference into name and tag. Untagged references get
/// `latest`; digest references are passed whole.
fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let colon = name_start + i;
            (&image[..colon], Some(&image[colon + 1..]))
        }
        None => (image, Some("latest")),
    }
}

/// The engine wants unix seconds; RFC3339 input is converted.
fn since_param(since: &str) -> String {
    if since.parse::<i64>().is_ok() {
        return since.to_string();
    }
    DateTime::parse_from_rfc3339(since)
        .map(|t| t.timestamp().to_string())
        .unwrap_or_else(|_| since.to_string())
}

#[cfg(test)]
mod tests {
    use std::path::Path as StdPath;

    use edge_testing::nginx_pod;

    use super::*;
    use crate::config::VolumeRoots;
    use crate::translate::translate;

    fn nginx_project() -> Project {
        translate(
            &nginx_pod("nginx-x1"),
            "edge",
            &VolumeRoots::under(StdPath::new("/data")),
        )
        .unwrap()
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("ubuntu"), ("ubuntu", Some("latest")));
        assert_eq!(split_image_ref("ubuntu:22.04"), ("ubuntu", Some("22.04")));
        assert_eq!(
            split_image_ref("registry:5000/team/app"),
            ("registry:5000/team/app", Some("latest"))
        );
        assert_eq!(
            split_image_ref("registry:5000/team/app:v2"),
            ("registry:5000/team/app", Some("v2"))
        );
        assert_eq!(split_image_ref("app@sha256:abcd"), ("app@sha256:abcd", None));
    }

    #[test]
    fn test_since_param() {
        assert_eq!(since_param("1714557600"), "1714557600");
        assert_eq!(since_param("2024-05-01T10:00:00Z"), "1714557600");
    }

    #[test]
    fn test_create_body_for_first_run_unit() {
        let project = nginx_project();
        let web = project.service("nginx-x1.web").unwrap();
        let hash = web.config_hash().unwrap();

        let body = create_body(&project, web, &hash, &HashMap::new()).unwrap();

        assert_eq!(body.host_config.network_mode, "edge_default");
        assert_eq!(
            body.networking_config.endpoints_config["edge_default"].aliases,
            vec!["nginx"]
        );
        assert_eq!(body.host_config.restart_policy.name, "always");
        assert_eq!(
            body.host_config.port_bindings["80/tcp"][0].host_port,
            "8080"
        );
        assert!(body.env.contains(&"NGINX_PORT=80".to_string()));
        assert_eq!(body.labels[labels::CONFIG_HASH], hash.as_str());
        assert!(body
            .host_config
            .binds
            .contains(&"/data/configmap/default/conf/nginx.conf:/etc/nginx/nginx.conf:ro".to_string()));
    }

    #[test]
    fn test_create_body_shares_namespace() {
        let project = nginx_project();
        let exporter = project.service("nginx-x1.exporter").unwrap();
        let hash = exporter.config_hash().unwrap();

        let err = create_body(&project, exporter, &hash, &HashMap::new()).unwrap_err();
        assert!(matches!(err, BackendError::UnknownDependency { .. }));

        let ids = HashMap::from([("nginx-x1.web".to_string(), "abc".to_string())]);
        let body = create_body(&project, exporter, &hash, &ids).unwrap();
        assert_eq!(body.host_config.network_mode, "container:abc");
        assert!(body.networking_config.endpoints_config.is_empty());
        assert!(body.host_config.port_bindings.is_empty());
        assert!(body.exposed_ports.contains_key("9113/tcp"));
    }
}
