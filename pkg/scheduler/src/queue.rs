//! Scheduling queue with active, backoff and unschedulable pools.
//!
//! The queue is a plain owned structure; the scheduling controller is its only
//! user and serializes every transition. Time is passed in explicitly.

use pkg_constants::scheduler::{
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_UNSCHEDULABLE_TIMEOUT_SECS,
};
use pkg_types::pod::Pod;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::RequeueAction;
use crate::event::ClusterEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest a pod stays unschedulable without any cluster event.
    pub unschedulable_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            unschedulable_timeout: Duration::from_secs(DEFAULT_UNSCHEDULABLE_TIMEOUT_SECS),
        }
    }
}

/// Which pool a queued pod currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Backoff,
    Unschedulable,
}

#[derive(Debug, Clone)]
pub struct QueuedPodInfo {
    pub pod: Arc<Pod>,
    /// Scheduling attempts so far, including the one in flight.
    pub attempts: u32,
    /// When the pod last entered a pool.
    pub timestamp: Instant,
    /// When the pod first entered the queue. Never reset.
    pub initial_attempt_timestamp: Instant,
    /// Scheduling cycle of the last pop.
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub active: usize,
    pub backoff: usize,
    pub unschedulable: usize,
}

#[derive(Debug)]
struct Entry {
    info: QueuedPodInfo,
    state: QueueState,
    backoff_until: Option<Instant>,
    /// Sequence number of the live heap item when `state` is Active.
    active_seq: u64,
}

#[derive(Debug, Default)]
struct InFlight {
    deleted: bool,
    /// Newest version seen while the pod was being evaluated.
    latest: Option<Arc<Pod>>,
}

/// Heap item for the active pool. Higher priority first, then FIFO.
#[derive(Debug, PartialEq, Eq)]
struct ActiveItem {
    priority: i32,
    seq: u64,
    key: String,
}

impl Ord for ActiveItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ActiveItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SchedulingQueue {
    config: QueueConfig,
    entries: HashMap<String, Entry>,
    /// May hold stale items; they are skipped on pop.
    active: BinaryHeap<ActiveItem>,
    in_flight: HashMap<String, InFlight>,
    next_seq: u64,
    scheduling_cycle: u64,
    /// Cycle at which the last wake-up event arrived.
    move_request_cycle: Option<u64>,
}

impl SchedulingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            active: BinaryHeap::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            scheduling_cycle: 0,
            move_request_cycle: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a new pending pod. Known pods are treated as updates.
    pub fn add(&mut self, pod: Arc<Pod>, now: Instant) {
        let key = pod.key();
        if self.entries.contains_key(&key) || self.in_flight.contains_key(&key) {
            self.update(pod, now);
            return;
        }
        debug!("Queueing pod {}", key);
        let info = QueuedPodInfo {
            pod,
            attempts: 0,
            timestamp: now,
            initial_attempt_timestamp: now,
            cycle: 0,
        };
        self.push_active(key, info);
    }

    /// Replace the queued version of a pod. A pod waiting in backoff or
    /// unschedulable is retried right away if anything it is scheduled on changed.
    pub fn update(&mut self, pod: Arc<Pod>, now: Instant) {
        let key = pod.key();
        if let Some(flight) = self.in_flight.get_mut(&key) {
            flight.latest = Some(pod);
            return;
        }
        let Some(entry) = self.entries.get_mut(&key) else {
            self.add(pod, now);
            return;
        };
        let changed = !entry.info.pod.same_scheduling_inputs(&pod);
        let priority_changed = entry.info.pod.priority() != pod.priority();
        entry.info.pod = pod;
        let state = entry.state;
        let mut info = entry.info.clone();
        match state {
            QueueState::Active if priority_changed => self.push_active(key, info),
            QueueState::Backoff | QueueState::Unschedulable if changed => {
                debug!("Pod {} changed, moving to active", key);
                info.timestamp = now;
                self.push_active(key, info);
            }
            _ => {}
        }
    }

    /// Remove a pod from whichever pool holds it. Idempotent. A pod that is
    /// being evaluated is marked so its result is discarded.
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if let Some(flight) = self.in_flight.get_mut(key) {
            flight.deleted = true;
            return true;
        }
        if removed {
            debug!("Removed pod {} from scheduling queue", key);
        }
        removed
    }

    /// Take the next active pod. The pod is in flight until `requeue` or `forget`.
    pub fn pop(&mut self, now: Instant) -> Option<QueuedPodInfo> {
        while let Some(item) = self.active.pop() {
            let live = self
                .entries
                .get(&item.key)
                .is_some_and(|e| e.state == QueueState::Active && e.active_seq == item.seq);
            if !live {
                continue;
            }
            let entry = self.entries.remove(&item.key)?;
            self.scheduling_cycle += 1;
            let mut info = entry.info;
            info.attempts += 1;
            info.cycle = self.scheduling_cycle;
            info.timestamp = now;
            self.in_flight.insert(item.key, InFlight::default());
            return Some(info);
        }
        None
    }

    /// True if the pod was deleted while being evaluated; its decision must
    /// not be acted upon.
    pub fn is_discarded(&self, key: &str) -> bool {
        self.in_flight.get(key).is_some_and(|f| f.deleted)
    }

    /// Finish an in-flight pod that was bound (or dropped) successfully.
    /// Returns false if the pod was not in flight.
    pub fn forget(&mut self, key: &str) -> bool {
        self.in_flight.remove(key).is_some()
    }

    /// Put a failed in-flight pod back. Returns true if the pod is queued again.
    pub fn requeue(&mut self, mut info: QueuedPodInfo, action: RequeueAction, now: Instant) -> bool {
        let key = info.pod.key();
        let flight = self.in_flight.remove(&key).unwrap_or_default();
        if flight.deleted {
            debug!("Pod {} was deleted during scheduling, dropping", key);
            return false;
        }
        let mut action = action;
        if let Some(latest) = flight.latest {
            if !latest.same_scheduling_inputs(&info.pod)
                && matches!(
                    action,
                    RequeueAction::Reject | RequeueAction::Unschedulable | RequeueAction::Backoff
                )
            {
                action = RequeueAction::Immediate;
            }
            info.pod = latest;
        }
        info.timestamp = now;

        match action {
            RequeueAction::Discard => false,
            RequeueAction::Reject => {
                info!("Dropping pod {} until it is updated", key);
                false
            }
            RequeueAction::Immediate => {
                self.push_active(key, info);
                true
            }
            RequeueAction::Backoff => {
                self.push_backoff(key, info, now);
                true
            }
            RequeueAction::Unschedulable => {
                // A wake-up arrived while this pod was evaluated on an older
                // snapshot; parking it would lose that event.
                if self.move_request_cycle.is_some_and(|c| c >= info.cycle) {
                    self.push_backoff(key, info, now);
                } else {
                    self.entries.insert(
                        key,
                        Entry {
                            info,
                            state: QueueState::Unschedulable,
                            backoff_until: None,
                            active_seq: 0,
                        },
                    );
                }
                true
            }
        }
    }

    /// React to a cluster change. Wake-up events sweep the whole
    /// unschedulable pool back to active.
    pub fn on_event(&mut self, event: &ClusterEvent, now: Instant) -> usize {
        if !event.is_wake_up() {
            return 0;
        }
        let moved = self.move_all_to_active(now);
        if moved > 0 {
            info!("{} event moved {} pod(s) to active", event.name(), moved);
        }
        moved
    }

    /// Move every unschedulable pod to active. Returns how many moved.
    pub fn move_all_to_active(&mut self, now: Instant) -> usize {
        self.move_request_cycle = Some(self.scheduling_cycle);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == QueueState::Unschedulable)
            .map(|(k, _)| k.clone())
            .collect();
        self.activate(keys, now)
    }

    /// Periodic maintenance: finished backoffs and pods that stayed
    /// unschedulable past the timeout go back to active.
    pub fn flush(&mut self, now: Instant) -> usize {
        let timeout = self.config.unschedulable_timeout;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| match e.state {
                QueueState::Backoff => e.backoff_until.is_none_or(|until| until <= now),
                QueueState::Unschedulable => {
                    now.saturating_duration_since(e.info.timestamp) >= timeout
                }
                QueueState::Active => false,
            })
            .map(|(k, _)| k.clone())
            .collect();
        let moved = self.activate(keys, now);
        if moved > 0 {
            debug!("Flushed {} pod(s) to active", moved);
        }
        moved
    }

    /// `initial * 2^(attempts - 1)`, capped at the configured maximum.
    pub fn backoff_duration(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.config
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }

    pub fn state(&self, key: &str) -> Option<QueueState> {
        self.entries.get(key).map(|e| e.state)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key) || self.in_flight.contains_key(key)
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                QueueState::Active => counts.active += 1,
                QueueState::Backoff => counts.backoff += 1,
                QueueState::Unschedulable => counts.unschedulable += 1,
            }
        }
        counts
    }

    /// Every pod waiting in one of the pools.
    pub fn pending_pods(&self) -> Vec<Arc<Pod>> {
        self.entries.values().map(|e| e.info.pod.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_active(&self) -> bool {
        self.entries.values().any(|e| e.state == QueueState::Active)
    }

    // --- Internal helpers ---

    fn push_active(&mut self, key: String, info: QueuedPodInfo) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.active.push(ActiveItem {
            priority: info.pod.priority(),
            seq,
            key: key.clone(),
        });
        self.entries.insert(
            key,
            Entry {
                info,
                state: QueueState::Active,
                backoff_until: None,
                active_seq: seq,
            },
        );
    }

    fn push_backoff(&mut self, key: String, info: QueuedPodInfo, now: Instant) {
        let until = now + self.backoff_duration(info.attempts);
        debug!("Backing off pod {} until +{:?}", key, until - now);
        self.entries.insert(
            key,
            Entry {
                info,
                state: QueueState::Backoff,
                backoff_until: Some(until),
                active_seq: 0,
            },
        );
    }

    fn activate(&mut self, keys: Vec<String>, now: Instant) -> usize {
        let mut moved = 0;
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                let mut info = entry.info;
                info.timestamp = now;
                self.push_active(key, info);
                moved += 1;
            }
        }
        moved
    }
}

impl Default for SchedulingQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::node::Node;

    fn pod(name: &str, priority: i32) -> Arc<Pod> {
        let mut pod = Pod::new("default", name);
        pod.spec.priority = priority;
        Arc::new(pod)
    }

    fn node_added() -> ClusterEvent {
        ClusterEvent::NodeAdded(Arc::new(Node::new("node-new")))
    }

    fn config() -> QueueConfig {
        QueueConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            unschedulable_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn pops_by_priority_then_arrival() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("low-1", 0), now);
        queue.add(pod("high", 10), now);
        queue.add(pod("low-2", 0), now);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop(now))
            .map(|info| info.pod.name.clone())
            .collect();
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    #[test]
    fn unschedulable_pod_wakes_up_on_node_add() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();
        assert!(queue.requeue(info, RequeueAction::Unschedulable, now));
        assert_eq!(queue.state("default/p"), Some(QueueState::Unschedulable));
        assert!(queue.pop(now).is_none());

        // Status-only changes do not wake anything up.
        let quiet = ClusterEvent::PodUpdated {
            old: pod("other", 0),
            new: pod("other", 0),
        };
        assert_eq!(queue.on_event(&quiet, now), 0);

        assert_eq!(queue.on_event(&node_added(), now), 1);
        assert_eq!(queue.state("default/p"), Some(QueueState::Active));
        assert_eq!(queue.pop(now).unwrap().attempts, 2);
    }

    #[test]
    fn unschedulable_pod_wakes_up_on_node_removal() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("web-1", 0), now);
        let info = queue.pop(now).unwrap();
        assert!(queue.requeue(info, RequeueAction::Unschedulable, now));

        let removed = ClusterEvent::NodeDeleted(Arc::new(Node::new("node-0")));
        assert_eq!(queue.on_event(&removed, now), 1);
        assert_eq!(queue.state("default/web-1"), Some(QueueState::Active));
    }

    #[test]
    fn wake_up_during_evaluation_goes_to_backoff() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();

        queue.on_event(&node_added(), now);
        assert!(queue.requeue(info, RequeueAction::Unschedulable, now));
        assert_eq!(queue.state("default/p"), Some(QueueState::Backoff));

        assert_eq!(queue.flush(now + Duration::from_millis(999)), 0);
        assert_eq!(queue.flush(now + Duration::from_secs(1)), 1);
        assert_eq!(queue.state("default/p"), Some(QueueState::Active));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let queue = SchedulingQueue::new(config());
        assert_eq!(queue.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(queue.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(queue.backoff_duration(4), Duration::from_secs(8));
        assert_eq!(queue.backoff_duration(5), Duration::from_secs(10));
        assert_eq!(queue.backoff_duration(100), Duration::from_secs(10));
    }

    #[test]
    fn requeue_actions() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        for name in ["conflict", "store", "gone", "bad"] {
            queue.add(pod(name, 0), now);
        }
        let mut popped: HashMap<String, QueuedPodInfo> = std::iter::from_fn(|| queue.pop(now))
            .map(|info| (info.pod.name.clone(), info))
            .collect();

        assert!(queue.requeue(popped.remove("conflict").unwrap(), RequeueAction::Immediate, now));
        assert!(queue.requeue(popped.remove("store").unwrap(), RequeueAction::Backoff, now));
        assert!(!queue.requeue(popped.remove("gone").unwrap(), RequeueAction::Discard, now));
        assert!(!queue.requeue(popped.remove("bad").unwrap(), RequeueAction::Reject, now));

        assert_eq!(
            queue.counts(),
            QueueCounts {
                active: 1,
                backoff: 1,
                unschedulable: 0
            }
        );
        assert!(!queue.contains("default/gone"));
    }

    #[test]
    fn delete_is_idempotent_in_every_pool() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("b", 0), now);
        let b = queue.pop(now).unwrap();
        queue.requeue(b, RequeueAction::Unschedulable, now);
        queue.add(pod("a", 0), now);

        assert!(queue.delete("default/b"));
        assert!(!queue.delete("default/b"));
        assert!(queue.delete("default/a"));
        assert!(!queue.delete("default/a"));
        assert!(queue.is_empty());
        assert!(queue.pop(now).is_none());
    }

    #[test]
    fn delete_during_evaluation_discards_the_result() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();

        assert!(queue.delete("default/p"));
        assert!(queue.is_discarded("default/p"));
        assert!(!queue.requeue(info, RequeueAction::Immediate, now));
        assert!(!queue.contains("default/p"));
        assert!(!queue.is_discarded("default/p"));
    }

    #[test]
    fn update_while_in_flight_retries_with_new_version() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();

        let mut changed = Pod::new("default", "p");
        changed.labels.insert("fixed".to_string(), "yes".to_string());
        queue.update(Arc::new(changed), now);

        assert!(queue.requeue(info, RequeueAction::Unschedulable, now));
        let retried = queue.pop(now).unwrap();
        assert_eq!(retried.pod.labels.get("fixed").map(String::as_str), Some("yes"));
    }

    #[test]
    fn updated_unschedulable_pod_is_retried() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();
        queue.requeue(info, RequeueAction::Unschedulable, now);

        // Same inputs: stays parked.
        queue.update(pod("p", 0), now);
        assert_eq!(queue.state("default/p"), Some(QueueState::Unschedulable));

        queue.update(pod("p", 5), now);
        assert_eq!(queue.state("default/p"), Some(QueueState::Active));
    }

    #[test]
    fn stale_unschedulable_pods_are_flushed() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();
        queue.requeue(info, RequeueAction::Unschedulable, now);

        assert_eq!(queue.flush(now + Duration::from_secs(59)), 0);
        assert_eq!(queue.flush(now + Duration::from_secs(60)), 1);
        assert!(queue.has_active());
    }

    #[test]
    fn forget_after_bind() {
        let now = Instant::now();
        let mut queue = SchedulingQueue::new(config());
        queue.add(pod("p", 0), now);
        let info = queue.pop(now).unwrap();
        assert!(queue.contains(&info.pod.key()));
        assert!(queue.forget(&info.pod.key()));
        assert!(!queue.forget(&info.pod.key()));
        assert!(!queue.contains("default/p"));
        assert_eq!(info.initial_attempt_timestamp, now);
    }
}
