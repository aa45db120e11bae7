//! State store / watch constants.

/// Key prefix under which nodes are stored: `/registry/nodes/<name>`.
pub const NODES_PREFIX: &str = "/registry/nodes/";

/// Key prefix under which pods are stored: `/registry/pods/<namespace>/<name>`.
pub const PODS_PREFIX: &str = "/registry/pods/";

/// Capacity of the live watch broadcast channel.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;
