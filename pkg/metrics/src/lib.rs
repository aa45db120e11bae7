use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of one scheduling attempt, as recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Scheduled,
    Unschedulable,
    Error,
}

/// Thread-safe scheduler metrics, rendered in Prometheus text exposition format.
#[derive(Default)]
pub struct SchedulerMetrics {
    attempts_scheduled: AtomicU64,
    attempts_unschedulable: AtomicU64,
    attempts_error: AtomicU64,
    bind_conflicts: AtomicU64,
    stale_snapshots: AtomicU64,
    preemption_attempts: AtomicU64,
    discarded_decisions: AtomicU64,
    evaluation_micros_sum: AtomicU64,
    evaluation_count: AtomicU64,
    queue_active: AtomicI64,
    queue_backoff: AtomicI64,
    queue_unschedulable: AtomicI64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, result: AttemptResult, evaluation: Duration) {
        let counter = match result {
            AttemptResult::Scheduled => &self.attempts_scheduled,
            AttemptResult::Unschedulable => &self.attempts_unschedulable,
            AttemptResult::Error => &self.attempts_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.evaluation_micros_sum
            .fetch_add(evaluation.as_micros() as u64, Ordering::Relaxed);
        self.evaluation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bind_conflicts(&self) {
        self.bind_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_snapshots(&self) {
        self.stale_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_preemption_attempts(&self) {
        self.preemption_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_discarded_decisions(&self) {
        self.discarded_decisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the size of each queue pool.
    pub fn set_queue_sizes(&self, active: usize, backoff: usize, unschedulable: usize) {
        self.queue_active.store(active as i64, Ordering::Relaxed);
        self.queue_backoff.store(backoff as i64, Ordering::Relaxed);
        self.queue_unschedulable
            .store(unschedulable as i64, Ordering::Relaxed);
    }

    pub fn attempts(&self, result: AttemptResult) -> u64 {
        match result {
            AttemptResult::Scheduled => self.attempts_scheduled.load(Ordering::Relaxed),
            AttemptResult::Unschedulable => self.attempts_unschedulable.load(Ordering::Relaxed),
            AttemptResult::Error => self.attempts_error.load(Ordering::Relaxed),
        }
    }

    pub fn bind_conflicts(&self) -> u64 {
        self.bind_conflicts.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "# HELP kplace_schedule_attempts_total Scheduling attempts by result."
        );
        let _ = writeln!(out, "# TYPE kplace_schedule_attempts_total counter");
        for (label, result) in [
            ("scheduled", AttemptResult::Scheduled),
            ("unschedulable", AttemptResult::Unschedulable),
            ("error", AttemptResult::Error),
        ] {
            let _ = writeln!(
                out,
                "kplace_schedule_attempts_total{{result=\"{}\"}} {}",
                label,
                self.attempts(result)
            );
        }

        for (name, help, value) in [
            (
                "kplace_bind_conflicts_total",
                "Binds that lost a race for node capacity.",
                &self.bind_conflicts,
            ),
            (
                "kplace_stale_snapshots_total",
                "Binds rejected because the node changed after the decision.",
                &self.stale_snapshots,
            ),
            (
                "kplace_preemption_attempts_total",
                "Times the preemption collaborator was invoked.",
                &self.preemption_attempts,
            ),
            (
                "kplace_discarded_decisions_total",
                "Decisions dropped because the pod was deleted or bound elsewhere.",
                &self.discarded_decisions,
            ),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value.load(Ordering::Relaxed));
        }

        let _ = writeln!(
            out,
            "# HELP kplace_pending_pods Pods waiting in each scheduling queue pool."
        );
        let _ = writeln!(out, "# TYPE kplace_pending_pods gauge");
        for (queue, value) in [
            ("active", &self.queue_active),
            ("backoff", &self.queue_backoff),
            ("unschedulable", &self.queue_unschedulable),
        ] {
            let _ = writeln!(
                out,
                "kplace_pending_pods{{queue=\"{}\"}} {}",
                queue,
                value.load(Ordering::Relaxed)
            );
        }

        let sum = self.evaluation_micros_sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(
            out,
            "# HELP kplace_evaluation_duration_seconds Time spent evaluating nodes for a pod."
        );
        let _ = writeln!(out, "# TYPE kplace_evaluation_duration_seconds summary");
        let _ = writeln!(out, "kplace_evaluation_duration_seconds_sum {}", sum);
        let _ = writeln!(
            out,
            "kplace_evaluation_duration_seconds_count {}",
            self.evaluation_count.load(Ordering::Relaxed)
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_counted_per_result() {
        let metrics = SchedulerMetrics::new();
        metrics.record_attempt(AttemptResult::Scheduled, Duration::from_millis(2));
        metrics.record_attempt(AttemptResult::Unschedulable, Duration::from_millis(3));
        metrics.record_attempt(AttemptResult::Unschedulable, Duration::from_millis(1));

        assert_eq!(metrics.attempts(AttemptResult::Scheduled), 1);
        assert_eq!(metrics.attempts(AttemptResult::Unschedulable), 2);
        assert_eq!(metrics.attempts(AttemptResult::Error), 0);
    }

    #[test]
    fn render_prometheus_text() {
        let metrics = SchedulerMetrics::new();
        metrics.inc_bind_conflicts();
        metrics.set_queue_sizes(3, 1, 2);
        metrics.record_attempt(AttemptResult::Scheduled, Duration::from_millis(500));

        let text = metrics.render();
        assert!(text.contains("# TYPE kplace_bind_conflicts_total counter"));
        assert!(text.contains("kplace_bind_conflicts_total 1"));
        assert!(text.contains("kplace_pending_pods{queue=\"active\"} 3"));
        assert!(text.contains("kplace_pending_pods{queue=\"unschedulable\"} 2"));
        assert!(text.contains("kplace_schedule_attempts_total{result=\"scheduled\"} 1"));
        assert!(text.contains("kplace_evaluation_duration_seconds_sum 0.5"));
    }
}
