//! Observation and governance runtime for multi-agent coding experiments.
//!
//! This crate implements the experiment runtime described by the project's
//! design documents: a filesystem-watching coordination backend, a
//! rule-matching runtime guard, and the experiment controller that ties agent
//! sessions, the guard, and the coordination backend together into a single
//! run. A thin CLI (`bin/helm`) wraps the library for interactive use.
//!
//! Pattern-file schema validation beyond what [`config`] itself performs,
//! the external LLM judge backends, and the underlying agent-session daemon
//! are external collaborators: this crate only speaks the daemon's HTTP+SSE
//! contract and consumes an optional `scores.json` the judge may have
//! written.

pub mod agent;
pub mod cli;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod event;
pub mod guard;
pub mod rundata;
pub mod session;
pub mod transcript;

pub use config::ExperimentConfig;
pub use controller::{ExperimentController, RunResult, TurnLimitDecision};
pub use error::HelmError;
