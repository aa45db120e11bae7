use async_trait::async_trait;
use pkg_types::node::Node;
use pkg_types::pod::Pod;

use crate::error::SchedulerResult;

/// Writes a scheduling decision back to the cluster.
///
/// `node` is the node as the decision saw it. Implementations must compare it
/// with the current state and fail with `SnapshotStale` or `BindConflict`
/// rather than bind against a cluster that moved on.
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, pod: &Pod, node: &Node) -> SchedulerResult<()>;
}
