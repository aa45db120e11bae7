//! SlateDB-backed cluster state store and its watch stream.

pub mod client;
pub mod watch;
