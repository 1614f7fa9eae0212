//! Crate-wide error taxonomy.
//!
//! Most call sites propagate via `anyhow::Result` with `.context(...)`, the
//! way the rest of the ambient stack does. This enum exists for the handful
//! of places that need to classify *why* a run ended, not just report it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HelmError {
    #[error("invalid experiment configuration: {0}")]
    ConfigInvalid(String),

    #[error("agent-session daemon unavailable: {0}")]
    SessionDaemonUnavailable(String),

    #[error("failed to stage workspace file '{0}': {1}")]
    StageFailed(String, String),

    #[error("event stream failed: {0}")]
    StreamFailed(String),

    #[error("escalation required human input and execution was paused: {0}")]
    EscalationPaused(String),

    #[error("turn budget exceeded for agent '{0}' ({1}/{2})")]
    TurnBudgetExceeded(String, u32, u32),

    #[error("experiment ended before completion signals were observed")]
    Incomplete,

    #[error("experiment exceeded its wall-clock duration")]
    Timeout,

    #[error("teardown did not fully complete: {0}")]
    TeardownPartial(String),
}
