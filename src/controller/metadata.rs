//! `metadata.json` — written once at setup (a pre-run snapshot) and again at
//! end-of-run with the run outcome appended.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AgentRole, ExperimentConfig, LimitsConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    pub role: AgentRole,
    pub harness: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStat {
    pub turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub reason: String,
    pub permission_id: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub agent_stats: HashMap<String, AgentStat>,
    pub ended_by_turn_limit: bool,
    pub escalations: Vec<EscalationRecord>,
    pub stream_errors: HashMap<String, String>,
}

/// The persisted experiment metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub id: String,
    pub name: String,
    /// `"hub_and_spoke"` or `"peer_network"`.
    pub pattern: String,
    pub created_at: DateTime<Utc>,
    pub agents: Vec<AgentMetadata>,
    pub limits: LimitsConfig,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub run: Option<RunOutcome>,
}

impl ExperimentMetadata {
    pub fn new_snapshot(id: &str, config: &ExperimentConfig) -> Self {
        let pattern = if config.is_hub_and_spoke() {
            "hub_and_spoke"
        } else {
            "peer_network"
        };
        Self {
            id: id.to_string(),
            name: config.name.clone(),
            pattern: pattern.to_string(),
            created_at: Utc::now(),
            agents: config
                .agents
                .iter()
                .map(|a| AgentMetadata {
                    id: a.id.clone(),
                    role: a.role.unwrap_or(AgentRole::Peer),
                    harness: a.harness.clone(),
                })
                .collect(),
            limits: config.limits.clone(),
            task: None,
            run: None,
        }
    }
}
