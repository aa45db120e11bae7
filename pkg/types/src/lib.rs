//! Object model shared by the scheduler, the state store and the daemon.

pub mod config;
pub mod node;
pub mod pod;
pub mod selector;
pub mod validate;
