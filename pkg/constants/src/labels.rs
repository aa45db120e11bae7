//! Well-known label keys.

/// Node label carrying the node's own name; the finest topology domain.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Default namespace for pods that do not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";
