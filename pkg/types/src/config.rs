use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::pod::Pod;

/// Scheduler daemon configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/kplace/data
/// metrics-port: 10259
/// parallelism: 8
/// initial-backoff-ms: 1000
/// max-backoff-ms: 10000
/// unschedulable-timeout-secs: 300
/// log-format: json
/// manifest: /etc/kplace/cluster.yaml
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "metrics-port")]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default, alias = "initial-backoff-ms")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, alias = "max-backoff-ms")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, alias = "unschedulable-timeout-secs")]
    pub unschedulable_timeout_secs: Option<u64>,
    /// `text` (default) or `json`
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
    /// Cluster manifest to seed the state store with at startup.
    #[serde(default)]
    pub manifest: Option<String>,
}

/// Nodes and pods to load into the state store.
///
/// Example `cluster.yaml`:
/// ```yaml
/// nodes:
///   - name: node-0
///     labels: { zone: zone-0 }
/// pods:
///   - name: web-0
///     labels: { app: web }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterManifest {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Load a cluster manifest. Unlike config files, the manifest must exist.
pub fn load_manifest(path: &str) -> anyhow::Result<ClusterManifest> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest {}: {}", path, e))?;
    let manifest: ClusterManifest = serde_yaml::from_str(&content)?;
    Ok(manifest)
}
