//! Scheduler and scheduling queue constants.

/// Backoff applied after the first failed attempt, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;

/// Upper bound on the exponential backoff, in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Maximum time a pod may stay in the unschedulable pool before it is retried
/// even without a cluster event.
pub const DEFAULT_UNSCHEDULABLE_TIMEOUT_SECS: u64 = 300;

/// How often the queue flushes completed backoffs and stale unschedulable pods.
pub const QUEUE_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Default number of worker threads used to evaluate nodes for one pod.
pub const DEFAULT_PARALLELISM: usize = 16;

/// Below this many nodes the evaluation runs on the calling thread.
pub const MIN_NODES_FOR_PARALLEL_EVALUATION: usize = 64;

/// Default port for the `/metrics` and `/healthz` endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 10259;

/// Largest weight accepted on a preferred affinity term.
pub const MAX_PREFERRED_WEIGHT: i32 = 100;
