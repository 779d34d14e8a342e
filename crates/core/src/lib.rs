//! Core library for shellstudy
//!
//! This crate contains the study state machines, task scheduling, sandbox
//! provisioning on a container runtime, filesystem snapshots and diffing,
//! configuration, logging, and error handling.

pub mod config;
pub mod diff;
pub mod docker;
pub mod errors;
pub mod logging;
pub mod participant;
pub mod repository;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod study_session;
pub mod task;
pub mod task_session;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
