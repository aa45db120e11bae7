use pkg_constants::scheduler::QUEUE_FLUSH_INTERVAL_MS;
use pkg_metrics::{AttemptResult, SchedulerMetrics};
use pkg_scheduler::binder::Binder;
use pkg_scheduler::cache::ClusterCache;
use pkg_scheduler::error::{RequeueAction, SchedulerError};
use pkg_scheduler::event::ClusterEvent;
use pkg_scheduler::preemption::{NoPreemption, Preemptor};
use pkg_scheduler::queue::{QueueConfig, QueuedPodInfo, SchedulingQueue};
use pkg_scheduler::{Scheduler, Snapshot};
use pkg_state::client::{StateStore, parse_node_key, parse_pod_key};
use pkg_state::watch::{EventType, ResourceKind, WatchEvent};
use pkg_types::node::Node;
use pkg_types::pod::Pod;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use crate::binder::StoreBinder;

/// Controller that places pending pods on nodes.
///
/// Owns the cluster cache and the scheduling queue. Watch events from the
/// state store feed both; pods are popped one at a time, evaluated on a
/// blocking thread against an immutable snapshot, then bound through the
/// `Binder`.
pub struct SchedulingController {
    store: StateStore,
    scheduler: Arc<Scheduler>,
    binder: Arc<dyn Binder>,
    preemptor: Arc<dyn Preemptor>,
    metrics: Arc<SchedulerMetrics>,
    queue_config: QueueConfig,
    flush_interval: Duration,
}

impl SchedulingController {
    pub fn new(store: StateStore, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            binder: Arc::new(StoreBinder::new(store.clone())),
            store,
            scheduler: Arc::new(Scheduler::new()),
            preemptor: Arc::new(NoPreemption),
            metrics,
            queue_config: QueueConfig::default(),
            flush_interval: Duration::from_millis(QUEUE_FLUSH_INTERVAL_MS),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_preemptor(mut self, preemptor: Arc<dyn Preemptor>) -> Self {
        self.preemptor = preemptor;
        self
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Start the controller loop as a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "SchedulingController started (flush={}ms, parallelism={})",
                self.flush_interval.as_millis(),
                self.scheduler.framework().parallelism()
            );
            // Subscribe before the first list so nothing falls in between.
            let events = self.store.event_log.subscribe();
            let mut interval = tokio::time::interval(self.flush_interval);
            let mut worker = Worker {
                cache: ClusterCache::new(),
                queue: SchedulingQueue::new(self.queue_config),
                events,
                needs_relist: true,
                ctl: self,
            };
            worker.relist().await;

            loop {
                let has_active = worker.queue.has_active();
                tokio::select! {
                    result = worker.events.recv() => {
                        match result {
                            Ok(event) => {
                                worker.apply(event);
                                worker.drain_events();
                            }
                            Err(RecvError::Lagged(n)) => {
                                warn!("SchedulingController lagged {} events, relisting", n);
                                worker.needs_relist = true;
                                worker.relist().await;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = interval.tick() => {
                        if worker.needs_relist {
                            worker.relist().await;
                        }
                        worker.queue.flush(Instant::now());
                    }
                    _ = std::future::ready(()), if has_active => {
                        if let Some(info) = worker.queue.pop(Instant::now()) {
                            worker.schedule_one(info).await;
                        }
                    }
                }
                worker.publish_queue_sizes();
            }
            info!("SchedulingController stopped");
        })
    }
}

/// Mutable state of the running controller. Only the loop task touches it.
struct Worker {
    ctl: SchedulingController,
    cache: ClusterCache,
    queue: SchedulingQueue,
    events: Receiver<WatchEvent>,
    needs_relist: bool,
}

impl Worker {
    /// Rebuild the cache from the store and sweep the queue. Retried on the
    /// next tick if the store cannot be read.
    async fn relist(&mut self) {
        match self.try_relist().await {
            Ok(()) => self.needs_relist = false,
            Err(e) => warn!("SchedulingController relist error: {}", e),
        }
    }

    async fn try_relist(&mut self) -> anyhow::Result<()> {
        let watermark = self.ctl.store.event_log.current_seq().await;
        let nodes = self.ctl.store.list_nodes().await?;
        let pods = self.ctl.store.list_pods().await?;
        self.rebuild(nodes, pods, watermark)
    }

    /// Replace the cache with listed objects, then replay buffered events
    /// newer than `watermark`. Events at or below it are already reflected
    /// in the lists; later ones may have landed after a list was read.
    fn rebuild(&mut self, nodes: Vec<Node>, pods: Vec<Pod>, watermark: u64) -> anyhow::Result<()> {
        self.cache.replace_all(nodes, pods);
        let now = Instant::now();
        let pending = self.cache.pending_pods();
        for queued in self.queue.pending_pods() {
            let key = queued.key();
            if !pending.iter().any(|p| p.key() == key) {
                self.queue.delete(&key);
            }
        }
        for pod in pending {
            self.queue.add(pod, now);
        }

        let mut replayed = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) if event.seq <= watermark => {}
                Ok(event) => {
                    self.apply(event);
                    replayed += 1;
                }
                Err(TryRecvError::Lagged(n)) => {
                    anyhow::bail!("watch lagged {} events during relist", n)
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        // Events may have been missed; nothing may stay parked because of it.
        self.queue.move_all_to_active(now);
        info!(
            "SchedulingController listed {} node(s), {} pending pod(s), replayed {} event(s)",
            self.cache.node_count(),
            self.queue.len(),
            replayed
        );
        Ok(())
    }

    /// Apply whatever is already buffered without waiting.
    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Lagged(_)) => self.needs_relist = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn apply(&mut self, event: WatchEvent) {
        let now = Instant::now();
        let change = match (event.kind(), event.event_type) {
            (Some(ResourceKind::Node), EventType::Put) => {
                decode::<Node>(&event).map(|node| self.cache.upsert_node(node))
            }
            (Some(ResourceKind::Node), EventType::Delete) => {
                parse_node_key(&event.key).and_then(|name| self.cache.remove_node(name))
            }
            (Some(ResourceKind::Pod), EventType::Put) => match decode::<Pod>(&event) {
                Some(pod) => {
                    let change = self.cache.upsert_pod(pod);
                    self.track_pod(&change, now);
                    Some(change)
                }
                None => None,
            },
            (Some(ResourceKind::Pod), EventType::Delete) => {
                let Some((namespace, name)) = parse_pod_key(&event.key) else {
                    return;
                };
                let key = format!("{}/{}", namespace, name);
                self.queue.delete(&key);
                self.cache.remove_pod(&key)
            }
            (None, _) => None,
        };
        if let Some(change) = change {
            debug!("SchedulingController observed {}", change.name());
            self.queue.on_event(&change, now);
        }
    }

    /// Keep the queue in line with a pod's latest version.
    fn track_pod(&mut self, change: &ClusterEvent, now: Instant) {
        let (old, new) = match change {
            ClusterEvent::PodAdded(new) => (None, new),
            ClusterEvent::PodUpdated { old, new } => (Some(old), new),
            _ => return,
        };
        let key = new.key();
        if !new.is_pending() {
            // Bound elsewhere or finished.
            self.queue.delete(&key);
            return;
        }
        let changed = old.is_none_or(|old| !old.same_scheduling_inputs(new));
        if changed || self.queue.contains(&key) {
            self.queue.update(new.clone(), now);
        }
    }

    /// One scheduling cycle for one pod.
    async fn schedule_one(&mut self, info: QueuedPodInfo) {
        let key = info.pod.key();
        let snapshot = self.cache.snapshot();
        let scheduler = self.ctl.scheduler.clone();
        let pod = info.pod.clone();
        let eval_snapshot = snapshot.clone();

        let started = Instant::now();
        let decision =
            tokio::task::spawn_blocking(move || scheduler.schedule(&pod, &eval_snapshot))
                .await
                .unwrap_or_else(|e| {
                    Err(SchedulerError::Store(anyhow::anyhow!(
                        "evaluation task failed: {}",
                        e
                    )))
                });
        let elapsed = started.elapsed();
        debug!(
            "Evaluated pod {} against snapshot generation {} in {:?}",
            key,
            snapshot.generation(),
            elapsed
        );

        // Events that arrived during evaluation may make the decision moot.
        self.drain_events();
        if self.queue.is_discarded(&key) {
            debug!("Discarding decision for deleted pod {}", key);
            self.ctl.metrics.inc_discarded_decisions();
            self.queue.requeue(info, RequeueAction::Discard, Instant::now());
            return;
        }

        let result = match decision {
            Ok(decision) => match snapshot.node(&decision.node_name) {
                Some(node_info) => self
                    .ctl
                    .binder
                    .bind(&info.pod, &node_info.node)
                    .await
                    .map(|_| decision.node_name),
                None => Err(SchedulerError::SnapshotStale {
                    pod: key.clone(),
                    node: decision.node_name,
                    reason: format!(
                        "node missing from snapshot generation {}",
                        snapshot.generation()
                    ),
                }),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(node_name) => {
                self.ctl
                    .metrics
                    .record_attempt(AttemptResult::Scheduled, elapsed);
                let change = self.cache.assume_pod(&info.pod, &node_name);
                self.queue.forget(&key);
                self.queue.on_event(&change, Instant::now());
                debug!(
                    "Pod {} scheduled after {} attempt(s) in {:?}",
                    key,
                    info.attempts,
                    info.initial_attempt_timestamp.elapsed()
                );
            }
            Err(e) => self.handle_failure(info, e, elapsed, &snapshot).await,
        }
    }

    async fn handle_failure(
        &mut self,
        info: QueuedPodInfo,
        err: SchedulerError,
        elapsed: Duration,
        snapshot: &Snapshot,
    ) {
        let key = info.pod.key();
        let metrics = &self.ctl.metrics;
        let outcome = match &err {
            SchedulerError::NoFeasibleNode { .. } | SchedulerError::InvalidSelector { .. } => {
                AttemptResult::Unschedulable
            }
            _ => AttemptResult::Error,
        };
        metrics.record_attempt(outcome, elapsed);

        match &err {
            SchedulerError::NoFeasibleNode { diagnosis, .. } => {
                info!("Pod {} is unschedulable: {}", key, diagnosis);
                metrics.inc_preemption_attempts();
                match self.ctl.preemptor.preempt(&info.pod, snapshot, diagnosis).await {
                    Ok(0) => {}
                    Ok(n) => info!("Preempted {} pod(s) for {}", n, key),
                    Err(e) => warn!("Preemption for {} failed: {}", key, e),
                }
            }
            SchedulerError::InvalidSelector { .. } => warn!("{}", err),
            SchedulerError::BindConflict { .. } => {
                metrics.inc_bind_conflicts();
                info!("{}", err);
            }
            SchedulerError::SnapshotStale { .. } => {
                metrics.inc_stale_snapshots();
                info!("{}", err);
            }
            SchedulerError::PodNotFound(_) | SchedulerError::AlreadyBound { .. } => {
                metrics.inc_discarded_decisions();
                debug!("{}", err);
            }
            SchedulerError::Store(_) => warn!("Scheduling {} failed: {}", key, err),
        }

        if outcome == AttemptResult::Unschedulable
            && let Err(e) = self.record_status_message(&info.pod, err.to_string()).await
        {
            warn!("Failed to record status for {}: {}", key, e);
        }

        // The status write above shows up as a status-only update.
        self.drain_events();
        self.queue.requeue(info, err.requeue_action(), Instant::now());
    }

    /// Write why the pod is still pending, unless it already says so.
    async fn record_status_message(&self, pod: &Pod, message: String) -> anyhow::Result<()> {
        let Some(mut current) = self.ctl.store.get_pod(&pod.namespace, &pod.name).await? else {
            return Ok(());
        };
        if !current.is_pending() || current.status_message.as_deref() == Some(message.as_str()) {
            return Ok(());
        }
        current.status_message = Some(message);
        self.ctl.store.put_pod(&current).await
    }

    fn publish_queue_sizes(&self) {
        let counts = self.queue.counts();
        self.ctl
            .metrics
            .set_queue_sizes(counts.active, counts.backoff, counts.unschedulable);
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &WatchEvent) -> Option<T> {
    let value = event.value.as_deref()?;
    match serde_json::from_slice(value) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!("Skipping undecodable object at {}: {}", event.key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pkg_scheduler::error::Diagnosis;
    use pkg_scheduler::queue::QueueState;
    use pkg_types::pod::{PodAffinityTerm, PodStatus};
    use pkg_types::selector::LabelSelector;
    use std::future::Future;

    async fn open_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn fast_queue() -> QueueConfig {
        QueueConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            unschedulable_timeout: Duration::from_secs(60),
        }
    }

    fn start(store: &StateStore, metrics: Arc<SchedulerMetrics>) -> SchedulingController {
        SchedulingController::new(store.clone(), metrics)
            .with_queue_config(fast_queue())
            .with_flush_interval(Duration::from_millis(20))
    }

    /// Poll until `check` holds, for up to five seconds.
    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn bound_to(store: &StateStore, name: &str) -> Option<String> {
        store
            .get_pod("default", name)
            .await
            .ok()
            .flatten()
            .and_then(|p| p.node_name)
    }

    fn pod(name: &str, app: &str) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.labels.insert("app".to_string(), app.to_string());
        pod
    }

    /// A worker driven by hand, without the loop task.
    fn worker(store: &StateStore) -> Worker {
        let ctl = start(store, Arc::new(SchedulerMetrics::new()));
        Worker {
            cache: ClusterCache::new(),
            queue: SchedulingQueue::new(ctl.queue_config),
            events: store.event_log.subscribe(),
            needs_relist: true,
            ctl,
        }
    }

    #[tokio::test]
    async fn relist_replays_events_newer_than_the_lists() {
        let (_dir, store) = open_store().await;
        store.put_node(&Node::new("node-1")).await.unwrap();
        let mut worker = worker(&store);

        let watermark = store.event_log.current_seq().await;
        let nodes = store.list_nodes().await.unwrap();
        let pods = store.list_pods().await.unwrap();
        // Written after the lists were read.
        store.put_node(&Node::new("node-2")).await.unwrap();
        store.put_pod(&pod("web", "web")).await.unwrap();

        worker.rebuild(nodes, pods, watermark).unwrap();
        assert_eq!(worker.cache.node_count(), 2);
        assert!(worker.cache.snapshot().node("node-2").is_some());
        assert_eq!(worker.queue.state("default/web"), Some(QueueState::Active));
    }

    #[tokio::test]
    async fn failed_relist_keeps_the_cache() {
        let (_dir, store) = open_store().await;
        store.put_node(&Node::new("node-1")).await.unwrap();
        store.put_pod(&pod("web", "web")).await.unwrap();
        let mut worker = worker(&store);
        worker.relist().await;
        assert!(!worker.needs_relist);

        store.clone().close().await.unwrap();
        worker.needs_relist = true;
        assert!(worker.try_relist().await.is_err());
        worker.relist().await;
        assert!(worker.needs_relist);
        assert_eq!(worker.cache.node_count(), 1);
        assert!(worker.queue.contains("default/web"));
    }

    #[tokio::test]
    async fn wake_up_during_evaluation_backs_off_instead_of_parking() {
        let (_dir, store) = open_store().await;
        store.put_pod(&pod("web", "web")).await.unwrap();
        let mut worker = worker(&store);
        worker.relist().await;

        // Nothing changes while the pod is evaluated: it is parked.
        let info = worker.queue.pop(Instant::now()).unwrap();
        worker.schedule_one(info).await;
        assert_eq!(
            worker.queue.state("default/web"),
            Some(QueueState::Unschedulable)
        );

        // A node lands after the snapshot is taken but before the failure
        // is requeued.
        worker.queue.move_all_to_active(Instant::now());
        let info = worker.queue.pop(Instant::now()).unwrap();
        store.put_node(&Node::new("node-1")).await.unwrap();
        worker.schedule_one(info).await;
        assert_eq!(worker.queue.state("default/web"), Some(QueueState::Backoff));
        assert_eq!(worker.cache.node_count(), 1);
    }

    #[tokio::test]
    async fn pending_pod_waits_for_a_node() {
        let (_dir, store) = open_store().await;
        let store = &store;
        store.put_pod(&pod("web", "web")).await.unwrap();
        let metrics = Arc::new(SchedulerMetrics::new());
        let handle = start(store, metrics.clone()).start();

        assert!(
            wait_for(|| async move {
                store
                    .get_pod("default", "web")
                    .await
                    .unwrap()
                    .and_then(|p| p.status_message)
                    .is_some_and(|m| m.contains("0/0 nodes are available"))
            })
            .await
        );

        store.put_node(&Node::new("node-1")).await.unwrap();
        assert!(wait_for(|| async move { bound_to(store, "web").await.is_some() }).await);

        let stored = store.get_pod("default", "web").await.unwrap().unwrap();
        assert_eq!(stored.status, PodStatus::Scheduled);
        assert!(stored.status_message.is_none());
        assert!(metrics.attempts(AttemptResult::Scheduled) >= 1);
        handle.abort();
    }

    #[tokio::test]
    async fn anti_affinity_spreads_replicas() {
        let (_dir, store) = open_store().await;
        let store = &store;
        for name in ["node-1", "node-2"] {
            let mut node = Node::new(name);
            node.labels.insert("node".to_string(), name.to_string());
            store.put_node(&node).await.unwrap();
        }
        let handle = start(store, Arc::new(SchedulerMetrics::new())).start();

        for i in 0..3 {
            let mut replica = pod(&format!("db-{}", i), "db");
            replica
                .spec
                .affinity
                .pod_anti_affinity
                .required
                .push(PodAffinityTerm::new(LabelSelector::new().label("app", "db"), "node"));
            store.put_pod(&replica).await.unwrap();
        }

        assert!(
            wait_for(|| async move {
                let pods = store.list_pods().await.unwrap();
                pods.iter().filter(|p| p.node_name.is_some()).count() == 2
                    && pods.iter().any(|p| p.status_message.is_some())
            })
            .await
        );
        let pods = store.list_pods().await.unwrap();
        let mut nodes: Vec<String> = pods.iter().filter_map(|p| p.node_name.clone()).collect();
        nodes.sort();
        assert_eq!(nodes, vec!["node-1", "node-2"]);

        // Deleting a replica frees its node for the parked one.
        let placed = pods.iter().find(|p| p.node_name.is_some()).unwrap();
        store.delete_pod("default", &placed.name).await.unwrap();
        assert!(
            wait_for(|| async move {
                let pods = store.list_pods().await.unwrap();
                pods.len() == 2 && pods.iter().all(|p| p.node_name.is_some())
            })
            .await
        );
        handle.abort();
    }

    /// Evicts the lowest-priority placed pod.
    struct EvictLowest {
        store: StateStore,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Preemptor for EvictLowest {
        async fn preempt(
            &self,
            pod: &Pod,
            snapshot: &Snapshot,
            _diagnosis: &Diagnosis,
        ) -> anyhow::Result<usize> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let victim = snapshot
                .placed_pods()
                .map(|(_, p)| p)
                .filter(|p| p.priority() < pod.priority())
                .min_by_key(|p| p.priority());
            match victim {
                Some(victim) => {
                    self.store.delete_pod(&victim.namespace, &victim.name).await?;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }

    #[tokio::test]
    async fn preemption_frees_room_through_requeue() {
        let (_dir, store) = open_store().await;
        let store = &store;
        let mut node = Node::new("node-1");
        node.capacity.cpu_millis = 1000;
        store.put_node(&node).await.unwrap();

        let mut low = pod("batch", "batch");
        low.spec.resources.cpu_millis = 800;
        low.node_name = Some("node-1".to_string());
        low.status = PodStatus::Running;
        store.put_pod(&low).await.unwrap();

        let preemptor = Arc::new(EvictLowest {
            store: store.clone(),
            calls: Default::default(),
        });
        let handle = start(store, Arc::new(SchedulerMetrics::new()))
            .with_preemptor(preemptor.clone())
            .start();

        let mut high = pod("api", "api");
        high.spec.priority = 100;
        high.spec.resources.cpu_millis = 500;
        store.put_pod(&high).await.unwrap();

        assert!(wait_for(|| async move { bound_to(store, "api").await.is_some() }).await);
        assert!(store.get_pod("default", "batch").await.unwrap().is_none());
        assert!(preemptor.calls.load(std::sync::atomic::Ordering::Relaxed) >= 1);
        handle.abort();
    }

    /// Loses every race once, then delegates to the store.
    struct RacyBinder {
        inner: StoreBinder,
        lost: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Binder for RacyBinder {
        async fn bind(&self, pod: &Pod, node: &Node) -> pkg_scheduler::SchedulerResult<()> {
            if !self.lost.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(SchedulerError::BindConflict {
                    pod: pod.key(),
                    node: node.name.clone(),
                    reason: "lost race".to_string(),
                });
            }
            self.inner.bind(pod, node).await
        }
    }

    #[tokio::test]
    async fn bind_conflict_is_retried() {
        let (_dir, store) = open_store().await;
        let store = &store;
        store.put_node(&Node::new("node-1")).await.unwrap();
        let metrics = Arc::new(SchedulerMetrics::new());
        let handle = start(store, metrics.clone())
            .with_binder(Arc::new(RacyBinder {
                inner: StoreBinder::new(store.clone()),
                lost: Default::default(),
            }))
            .start();

        store.put_pod(&pod("web", "web")).await.unwrap();
        assert!(wait_for(|| async move { bound_to(store, "web").await.is_some() }).await);
        assert_eq!(metrics.bind_conflicts(), 1);
        handle.abort();
    }
}
