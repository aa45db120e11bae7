use axum::Router;
use axum::extract::State;
use axum::routing::get;
use clap::Parser;
use pkg_constants::labels::LABEL_HOSTNAME;
use pkg_constants::paths::{DEFAULT_SCHEDULER_CONFIG, DEFAULT_SCHEDULER_DATA_DIR};
use pkg_constants::scheduler::{
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_METRICS_PORT, DEFAULT_PARALLELISM,
    DEFAULT_UNSCHEDULABLE_TIMEOUT_SECS,
};
use pkg_controllers::scheduling::SchedulingController;
use pkg_metrics::SchedulerMetrics;
use pkg_scheduler::Scheduler;
use pkg_scheduler::queue::QueueConfig;
use pkg_state::client::StateStore;
use pkg_types::config::{SchedulerConfigFile, load_config_file, load_manifest};
use pkg_types::validate::validate_pod;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kplace-scheduler", about = "kplace pod placement scheduler")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SCHEDULER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Port for /metrics and /healthz
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Threads used to evaluate nodes for one pod
    #[arg(long)]
    parallelism: Option<usize>,

    #[arg(long)]
    initial_backoff_ms: Option<u64>,

    #[arg(long)]
    max_backoff_ms: Option<u64>,

    #[arg(long)]
    unschedulable_timeout_secs: Option<u64>,

    /// Log output format: text or json
    #[arg(long)]
    log_format: Option<String>,

    /// YAML cluster manifest (nodes and pods) to seed the store with
    #[arg(long)]
    manifest: Option<String>,
}

/// Effective settings after merging CLI args > config file > defaults.
#[derive(Debug)]
struct Settings {
    data_dir: String,
    metrics_port: u16,
    parallelism: usize,
    queue: QueueConfig,
    log_format: String,
    manifest: Option<String>,
}

impl Settings {
    fn merge(cli: Cli, file_cfg: SchedulerConfigFile) -> Self {
        Self {
            data_dir: cli
                .data_dir
                .or(file_cfg.data_dir)
                .unwrap_or_else(|| DEFAULT_SCHEDULER_DATA_DIR.to_string()),
            metrics_port: cli
                .metrics_port
                .or(file_cfg.metrics_port)
                .unwrap_or(DEFAULT_METRICS_PORT),
            parallelism: cli
                .parallelism
                .or(file_cfg.parallelism)
                .unwrap_or(DEFAULT_PARALLELISM),
            queue: QueueConfig {
                initial_backoff: Duration::from_millis(
                    cli.initial_backoff_ms
                        .or(file_cfg.initial_backoff_ms)
                        .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
                ),
                max_backoff: Duration::from_millis(
                    cli.max_backoff_ms
                        .or(file_cfg.max_backoff_ms)
                        .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
                ),
                unschedulable_timeout: Duration::from_secs(
                    cli.unschedulable_timeout_secs
                        .or(file_cfg.unschedulable_timeout_secs)
                        .unwrap_or(DEFAULT_UNSCHEDULABLE_TIMEOUT_SECS),
                ),
            },
            log_format: cli
                .log_format
                .or(file_cfg.log_format)
                .unwrap_or_else(|| "text".to_string()),
            manifest: cli.manifest.or(file_cfg.manifest),
        }
    }
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load nodes and pods from a manifest. Nodes get a hostname label if they
/// lack one. Existing pods are left untouched so a restart does not undo
/// bindings.
async fn seed_from_manifest(store: &StateStore, path: &str) -> anyhow::Result<()> {
    let manifest = load_manifest(path)?;
    for mut node in manifest.nodes {
        if node.id.is_empty() {
            node.id = Uuid::new_v4().to_string();
        }
        node.labels
            .entry(LABEL_HOSTNAME.to_string())
            .or_insert_with(|| node.name.clone());
        store.put_node(&node).await?;
    }

    let mut seeded = 0;
    for mut pod in manifest.pods {
        if let Err(e) = validate_pod(&pod) {
            warn!("Skipping pod {} from manifest: {}", pod.key(), e);
            continue;
        }
        if store.get_pod(&pod.namespace, &pod.name).await?.is_some() {
            continue;
        }
        if pod.id.is_empty() {
            pod.id = Uuid::new_v4().to_string();
        }
        store.put_pod(&pod).await?;
        seeded += 1;
    }
    info!("Seeded {} pod(s) from {}", seeded, path);
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<SchedulerMetrics>>) -> String {
    metrics.render()
}

async fn healthz() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let config_path = cli.config.clone();
    let file_cfg: SchedulerConfigFile = load_config_file(&config_path)?;
    let settings = Settings::merge(cli, file_cfg);
    init_logging(&settings.log_format);

    info!("Starting kplace-scheduler");
    info!("  Config:       {}", config_path);
    info!("  Data dir:     {}", settings.data_dir);
    info!("  Metrics port: {}", settings.metrics_port);
    info!("  Parallelism:  {}", settings.parallelism);

    let store = StateStore::new(&settings.data_dir).await?;
    if let Some(ref manifest) = settings.manifest {
        seed_from_manifest(&store, manifest).await?;
    }

    let metrics = Arc::new(SchedulerMetrics::new());
    let controller = SchedulingController::new(store.clone(), metrics.clone())
        .with_scheduler(Scheduler::with_parallelism(settings.parallelism))
        .with_queue_config(settings.queue)
        .start();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    info!("Serving metrics on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    controller.abort();
    store.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_and_defaults() {
        let cli = Cli::parse_from(["kplace-scheduler", "--parallelism", "4"]);
        let file_cfg = SchedulerConfigFile {
            parallelism: Some(2),
            max_backoff_ms: Some(5_000),
            ..Default::default()
        };
        let settings = Settings::merge(cli, file_cfg);
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.queue.max_backoff, Duration::from_secs(5));
        assert_eq!(settings.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(settings.data_dir, DEFAULT_SCHEDULER_DATA_DIR);
        assert_eq!(settings.log_format, "text");
    }

    #[tokio::test]
    async fn manifest_seeding_skips_invalid_and_existing_pods() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("data").to_str().unwrap())
            .await
            .unwrap();
        let manifest = dir.path().join("cluster.yaml");
        std::fs::write(
            &manifest,
            r#"
nodes:
  - name: node-0
    labels: { zone: zone-0 }
pods:
  - name: web-0
    labels: { app: web }
  - name: broken
    spec:
      topology_spread_constraints:
        - max_skew: 0
          topology_key: zone
          label_selector: {}
"#,
        )
        .unwrap();
        let path = manifest.to_str().unwrap();

        seed_from_manifest(&store, path).await.unwrap();
        let node = store.get_node("node-0").await.unwrap().unwrap();
        assert!(!node.id.is_empty());
        assert_eq!(node.topology_value(LABEL_HOSTNAME), Some("node-0"));
        assert!(store.get_pod("default", "web-0").await.unwrap().is_some());
        assert!(store.get_pod("default", "broken").await.unwrap().is_none());

        let mut bound = store.get_pod("default", "web-0").await.unwrap().unwrap();
        bound.node_name = Some("node-0".to_string());
        store.put_pod(&bound).await.unwrap();
        seed_from_manifest(&store, path).await.unwrap();
        let again = store.get_pod("default", "web-0").await.unwrap().unwrap();
        assert_eq!(again.node_name.as_deref(), Some("node-0"));
    }
}
