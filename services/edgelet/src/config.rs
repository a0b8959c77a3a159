//! Configuration for the edge node agent.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Environment variable whose presence means the agent runs inside an
/// orchestrator-managed host.
pub const HOSTED_PROBE_VAR: &str = "KUBERNETES_SERVICE_HOST";

/// Edge node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name this node reports to the control plane.
    pub node_name: String,

    /// Container engine project all pods of this node live in.
    pub project: String,

    /// Parent directory of the per-kind volume roots.
    pub data_dir: PathBuf,

    /// Address reported as node address, host IP and pod IP.
    pub node_ip: String,

    /// Path of the container engine API socket.
    pub docker_socket: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Node status report interval in seconds.
    pub status_interval_secs: u64,

    /// Static capacity facts reported with node status.
    pub capacity: NodeCapacity,
}

/// Static node capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    pub cpu: u32,
    pub memory_gib: u32,
    pub pods: u32,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            cpu: 100,
            memory_gib: 100,
            pods: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u32| -> Result<u32> {
            match lookup(key).filter(|value| !value.is_empty()) {
                Some(value) => match value.parse() {
                    Ok(n) => Ok(n),
                    Err(_) => bail!("{key} must be a non-negative integer, got {value:?}"),
                },
                None => Ok(default),
            }
        };

        let project = var("EDGE_PROJECT", "edge");
        if project.trim().is_empty() {
            bail!("EDGE_PROJECT must not be blank");
        }

        let defaults = NodeCapacity::default();
        let capacity = NodeCapacity {
            cpu: number("EDGE_CAPACITY_CPU", defaults.cpu)?,
            memory_gib: number("EDGE_CAPACITY_MEMORY_GIB", defaults.memory_gib)?,
            pods: number("EDGE_CAPACITY_PODS", defaults.pods)?,
        };
        let status_interval_secs = u64::from(number("EDGE_STATUS_INTERVAL", 10)?.max(1));

        Ok(Self {
            node_name: var("EDGE_NODE_NAME", "edge-node"),
            project,
            data_dir: PathBuf::from(var("EDGE_DATA_DIR", "/var/lib/edgelet")),
            node_ip: var("EDGE_NODE_IP", "127.0.0.1"),
            docker_socket: PathBuf::from(var("EDGE_DOCKER_SOCKET", "/var/run/docker.sock")),
            log_level: var("EDGE_LOG_LEVEL", "info"),
            status_interval_secs,
            capacity,
        })
    }

    /// Volume roots under the data directory.
    pub fn volume_roots(&self) -> VolumeRoots {
        VolumeRoots::under(&self.data_dir)
    }

    /// Whether the hosting environment is an orchestrator.
    pub fn hosted() -> bool {
        hosted_from(std::env::var(HOSTED_PROBE_VAR).ok())
    }
}

fn hosted_from(value: Option<String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

/// Node-local directories backing the generated volume kinds.
///
/// Each root is further scoped by `{namespace}/{volume}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRoots {
    pub empty_dir: PathBuf,
    pub config_map: PathBuf,
    pub secret: PathBuf,
}

impl VolumeRoots {
    pub fn under(data_dir: &Path) -> Self {
        Self {
            empty_dir: data_dir.join("emptydir"),
            config_map: data_dir.join("configmap"),
            secret: data_dir.join("secret"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.node_name, "edge-node");
        assert_eq!(config.project, "edge");
        assert_eq!(config.node_ip, "127.0.0.1");
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.capacity, NodeCapacity::default());
        assert_eq!(config.status_interval_secs, 10);
        assert_eq!(
            config.volume_roots().config_map,
            PathBuf::from("/var/lib/edgelet/configmap")
        );
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("EDGE_NODE_NAME", "rpi-7"),
            ("EDGE_PROJECT", "fleet"),
            ("EDGE_DATA_DIR", "/data"),
            ("EDGE_CAPACITY_PODS", "12"),
        ])
        .unwrap();
        assert_eq!(config.node_name, "rpi-7");
        assert_eq!(config.project, "fleet");
        assert_eq!(config.capacity.pods, 12);
        assert_eq!(config.volume_roots().secret, PathBuf::from("/data/secret"));
    }

    #[test]
    fn test_blank_project_rejected() {
        assert!(config(&[("EDGE_PROJECT", "   ")]).is_err());
    }

    #[test]
    fn test_bad_capacity_rejected() {
        let err = config(&[("EDGE_CAPACITY_CPU", "many")]).unwrap_err();
        assert!(err.to_string().contains("EDGE_CAPACITY_CPU"));
    }

    #[test]
    fn test_hosted_probe() {
        assert!(!hosted_from(None));
        assert!(!hosted_from(Some(String::new())));
        assert!(hosted_from(Some("10.96.0.1".to_string())));
    }
}
