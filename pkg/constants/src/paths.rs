//! Filesystem path constants.

/// Default config file path for the scheduler daemon.
pub const DEFAULT_SCHEDULER_CONFIG: &str = "/etc/kplace/config.yaml";

/// Default data directory for the scheduler's state store.
pub const DEFAULT_SCHEDULER_DATA_DIR: &str = "/tmp/kplace-data";
