//! Runtime agent state.
//!
//! One [`AgentState`] per registered agent, created at setup and mutated
//! only inside the controller's event loop and the guard it delegates to.

use chrono::{DateTime, Utc};

use crate::config::AgentRole;

/// Mutable runtime state for a single agent, distinct from its static
/// [`AgentConfig`](crate::config::AgentConfig).
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: String,
    pub session_id: String,
    pub role: AgentRole,
    pub turn_count: u32,
    pub last_activity: DateTime<Utc>,
}

impl AgentState {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            turn_count: 0,
            last_activity: Utc::now(),
        }
    }
}
