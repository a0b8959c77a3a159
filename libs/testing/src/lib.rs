//! Pod fixtures for tests.
//!
//! Builders return plain `edge-podspec` values so tests can tweak any field
//! after construction.

use edge_podspec::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    HostPathVolumeSource, OwnerReference, Pod, Protocol, SecretVolumeSource, Volume, VolumeMount,
};

/// Namespace used by fixtures.
pub const NAMESPACE: &str = "default";

/// A container running `image` with the given command.
pub fn container(name: &str, image: &str, command: &[&str]) -> Container {
    Container {
        name: name.to_string(),
        image: image.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// An empty pod in the fixture namespace.
pub fn pod(name: &str) -> Pod {
    let mut pod = Pod::default();
    pod.api_version = Some("v1".to_string());
    pod.kind = Some("Pod".to_string());
    pod.metadata.name = name.to_string();
    pod.metadata.namespace = NAMESPACE.to_string();
    pod
}

/// One init unit (`sleep 1`) gating one long-running unit with a mapped port.
pub fn pod_with_init(name: &str) -> Pod {
    let mut pod = pod(name);
    pod.spec
        .init_containers
        .push(container("init", "ubuntu:latest", &["sleep", "1"]));

    let mut app = container("app", "ubuntu:latest", &["sleep", "10d"]);
    app.ports.push(tcp_port(80, Some(8080)));
    pod.spec.containers.push(app);
    pod
}

/// A two-container pod owned by a DaemonSet, with an app label and a volume
/// of every kind the agent understands.
pub fn nginx_pod(name: &str) -> Pod {
    let mut pod = pod(name);
    pod.metadata
        .labels
        .insert("k8s-app".to_string(), "nginx".to_string());
    pod.metadata.owner_references.push(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "DaemonSet".to_string(),
        name: "nginx-deployment".to_string(),
        ..Default::default()
    });

    pod.spec.volumes = vec![
        host_path_volume("logs", "/var/log/nginx"),
        empty_dir_volume("cache"),
        config_map_volume("conf"),
        secret_volume("tls"),
    ];

    let mut web = container("web", "nginx:latest", &[]);
    web.ports.push(tcp_port(80, Some(8080)));
    web.env.push(EnvVar::literal("NGINX_PORT", "80"));
    web.volume_mounts = vec![
        mount("logs", "/var/log/nginx"),
        mount("cache", "/var/cache/nginx"),
        VolumeMount {
            sub_path: Some("nginx.conf".to_string()),
            read_only: true,
            ..mount("conf", "/etc/nginx/nginx.conf")
        },
        VolumeMount {
            read_only: true,
            ..mount("tls", "/etc/nginx/tls")
        },
    ];

    let mut sidecar = container("exporter", "nginx/nginx-prometheus-exporter:latest", &[]);
    sidecar.args = vec!["-nginx.scrape-uri=http://localhost:80/stub_status".to_string()];
    sidecar.ports.push(tcp_port(9113, None));

    pod.spec.containers = vec![web, sidecar];
    pod
}

pub fn tcp_port(container_port: u16, host_port: Option<u16>) -> ContainerPort {
    ContainerPort {
        container_port,
        host_port,
        protocol: Protocol::Tcp,
        ..Default::default()
    }
}

pub fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn config_map_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn secret_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
