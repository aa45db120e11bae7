use async_trait::async_trait;
use pkg_types::pod::Pod;

use crate::error::Diagnosis;
use crate::snapshot::Snapshot;

/// Frees room for a pod that fits nowhere, typically by evicting
/// lower-priority pods. Evictions show up as ordinary delete events, which
/// wake the pod up again; nothing else is coupled to the scheduler.
#[async_trait]
pub trait Preemptor: Send + Sync {
    /// Returns the number of pods evicted.
    async fn preempt(
        &self,
        pod: &Pod,
        snapshot: &Snapshot,
        diagnosis: &Diagnosis,
    ) -> anyhow::Result<usize>;
}

/// Never evicts anything.
pub struct NoPreemption;

#[async_trait]
impl Preemptor for NoPreemption {
    async fn preempt(&self, _: &Pod, _: &Snapshot, _: &Diagnosis) -> anyhow::Result<usize> {
        Ok(0)
    }
}
