//! Flowpilot Core Library
//!
//! Shared foundation for the flowpilot workflow engine: the typed step
//! and condition model, step-output and run-result types, the error
//! taxonomy, capability traits for the engine's external collaborators
//! (plugin runtime, LLM runtime, persistence, audit, approvals), and
//! engine configuration.
//!
//! The execution machinery itself lives in `flowpilot-engine`; this crate
//! deliberately contains no I/O beyond environment lookups so that every
//! collaborator can depend on it.

pub mod condition;
pub mod config;
pub mod error;
pub mod step;
pub mod traits;
pub mod types;
pub mod workflow;
