//! Centralized constants for the kplace project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod labels;
pub mod paths;
pub mod scheduler;
pub mod state;
