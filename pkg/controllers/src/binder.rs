use async_trait::async_trait;
use pkg_scheduler::binder::Binder;
use pkg_scheduler::error::{SchedulerError, SchedulerResult};
use pkg_state::client::StateStore;
use pkg_types::node::Node;
use pkg_types::pod::{Pod, PodStatus, ResourceRequirements};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Binds pods by writing `node_name` into the state store.
///
/// Binds are serialized so the capacity check and the write cannot
/// interleave with another bind from this process.
pub struct StoreBinder {
    store: StateStore,
    lock: Mutex<()>,
}

impl StoreBinder {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Resources already requested on `node_name` by pods other than `key`.
    async fn requested_on(&self, node_name: &str, key: &str) -> anyhow::Result<ResourceRequirements> {
        let pods = self.store.list_pods().await?;
        Ok(pods
            .iter()
            .filter(|p| p.is_placed() && p.node_name.as_deref() == Some(node_name))
            .filter(|p| p.key() != key)
            .fold(ResourceRequirements::default(), |acc, p| acc.add(&p.spec.resources)))
    }
}

#[async_trait]
impl Binder for StoreBinder {
    async fn bind(&self, pod: &Pod, node: &Node) -> SchedulerResult<()> {
        let _guard = self.lock.lock().await;
        let key = pod.key();

        let Some(mut current) = self.store.get_pod(&pod.namespace, &pod.name).await? else {
            return Err(SchedulerError::PodNotFound(key));
        };
        if let Some(ref bound) = current.node_name {
            return Err(SchedulerError::AlreadyBound {
                pod: key,
                node: bound.clone(),
            });
        }
        if current.status.is_terminal() {
            return Err(SchedulerError::PodNotFound(key));
        }
        if !current.same_scheduling_inputs(pod) {
            return Err(SchedulerError::SnapshotStale {
                pod: key,
                node: node.name.clone(),
                reason: "pod changed since the decision".to_string(),
            });
        }

        let Some(live) = self.store.get_node(&node.name).await? else {
            return Err(SchedulerError::SnapshotStale {
                pod: key,
                node: node.name.clone(),
                reason: "node no longer exists".to_string(),
            });
        };
        if !live.same_scheduling_inputs(node) {
            return Err(SchedulerError::SnapshotStale {
                pod: key,
                node: node.name.clone(),
                reason: "node changed since the decision".to_string(),
            });
        }

        let needed = self
            .requested_on(&live.name, &key)
            .await?
            .add(&current.spec.resources);
        if !needed.fits_within(&live.capacity) {
            debug!(
                "Node {} needs cpu={}m mem={}B, capacity cpu={}m mem={}B",
                live.name,
                needed.cpu_millis,
                needed.memory_bytes,
                live.capacity.cpu_millis,
                live.capacity.memory_bytes
            );
            return Err(SchedulerError::BindConflict {
                pod: key,
                node: live.name.clone(),
                reason: "node capacity already consumed".to_string(),
            });
        }

        current.node_name = Some(live.name.clone());
        current.status = PodStatus::Scheduled;
        current.status_message = None;
        self.store.put_pod(&current).await?;
        info!("Bound pod {} to node {}", key, live.name);
        Ok(())
    }
}
