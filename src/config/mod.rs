//! Strongly-typed experiment configuration, parsed from a declarative YAML
//! "pattern" document.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::HelmError;

/// Role an agent plays in a coordination pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Hub,
    Worker,
    Peer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Hub => "hub",
            AgentRole::Worker => "worker",
            AgentRole::Peer => "peer",
        }
    }
}

/// Actions the runtime guard can take when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorAction {
    Approve,
    Reject,
    Escalate,
    EscalateToHuman,
    Log,
    Nudge,
    NudgeCoordinator,
}

/// Configuration for a single agent in the experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default = "default_harness")]
    pub harness: String,
    #[serde(default)]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub system_prompt: String,
}

fn default_harness() -> String {
    "claude-code".to_string()
}

/// A rule defining when and how the runtime guard intervenes.
///
/// Note: YAML 1.1 parses a bare `on:` key as the boolean `true`; the loader
/// rewrites it back to the string key `"on"` before this struct ever sees it
/// (see [`fix_yaml_boolean_keys`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorRule {
    pub on: String,
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    #[serde(default, rename = "from")]
    pub from_agent: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub then: OrchestratorAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Configuration for the runtime guard's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_observer_role")]
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<OrchestratorRule>,
}

fn default_observer_role() -> String {
    "observer".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            role: default_observer_role(),
            description: String::new(),
            rules: Vec::new(),
        }
    }
}

/// Filesystem paths for coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationPaths {
    #[serde(default = "default_base")]
    pub base: String,
    // Hub-and-spoke paths
    #[serde(default)]
    pub tasks: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub blocked: Option<String>,
    #[serde(default)]
    pub questions: Option<String>,
    #[serde(default)]
    pub decisions: Option<String>,
    // Peer-network paths
    #[serde(default)]
    pub messages: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub signals: Option<String>,
    #[serde(default)]
    pub reviews: Option<String>,
}

fn default_base() -> String {
    "coordination/".to_string()
}

impl Default for CoordinationPaths {
    fn default() -> Self {
        Self {
            base: default_base(),
            tasks: None,
            status: None,
            blocked: None,
            questions: None,
            decisions: None,
            messages: None,
            state: None,
            signals: None,
            reviews: None,
        }
    }
}

/// Configuration for inter-agent coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_mechanism")]
    pub mechanism: String,
    #[serde(default)]
    pub paths: CoordinationPaths,
    #[serde(default)]
    pub backend_settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub task_format: Option<String>,
    #[serde(default)]
    pub message_format: Option<String>,
    #[serde(default)]
    pub state_schema: Option<serde_json::Value>,
}

fn default_mechanism() -> String {
    "filesystem".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            mechanism: default_mechanism(),
            paths: CoordinationPaths::default(),
            backend_settings: HashMap::new(),
            task_format: None,
            message_format: None,
            state_schema: None,
        }
    }
}

/// Backend used by the (external) evaluation judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeBackendType {
    Openrouter,
    Sdk,
}

/// Configuration for the evaluation judge. The judge itself is an external
/// collaborator; only its configuration shape lives here so patterns
/// round-trip losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_backend")]
    pub backend: JudgeBackendType,
    #[serde(default = "default_judge_model")]
    pub model: String,
}

fn default_judge_backend() -> JudgeBackendType {
    JudgeBackendType::Sdk
}

fn default_judge_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            backend: default_judge_backend(),
            model: default_judge_model(),
        }
    }
}

/// Configuration for experiment evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub judge: JudgeConfig,
}

/// Resource limits for the experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_duration")]
    pub max_duration: String,
    #[serde(default = "default_max_turns")]
    pub max_turns_per_agent: u32,
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub workspace_files: HashMap<String, String>,
}

fn default_max_duration() -> String {
    "30m".to_string()
}
fn default_max_turns() -> u32 {
    50
}
fn default_max_budget() -> f64 {
    15.00
}
fn default_blocked_commands() -> Vec<String> {
    vec!["rm -rf".to_string(), "sudo".to_string()]
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_duration: default_max_duration(),
            max_turns_per_agent: default_max_turns(),
            max_budget_usd: default_max_budget(),
            blocked_commands: default_blocked_commands(),
            workspace_files: HashMap::new(),
        }
    }
}

impl LimitsConfig {
    /// Parse `max_duration` ("30m", "90s", "2h", or a bare integer) to seconds.
    pub fn duration_seconds(&self) -> Result<u64> {
        parse_duration_seconds(&self.max_duration)
    }
}

/// Parse a duration string with an `s`/`m`/`h` suffix (bare integer = seconds).
pub fn parse_duration_seconds(duration: &str) -> Result<u64> {
    let trimmed = duration.trim().to_lowercase();
    let (digits, multiplier) = if let Some(d) = trimmed.strip_suffix('s') {
        (d, 1)
    } else if let Some(d) = trimmed.strip_suffix('m') {
        (d, 60)
    } else if let Some(d) = trimmed.strip_suffix('h') {
        (d, 3600)
    } else {
        (trimmed.as_str(), 1)
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration string: '{duration}'"))?;
    Ok(value * multiplier)
}

/// Metadata about the experiment pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Complete experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub metadata: ExperimentMetadata,
}

impl ExperimentConfig {
    /// Load configuration from a YAML pattern file.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pattern file {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    /// Parse configuration from a YAML string, applying the boolean-key fix.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| HelmError::ConfigInvalid(e.to_string()))
            .context("parsing pattern YAML")?;
        fix_yaml_boolean_keys(&mut value);
        serde_yaml::from_value(value)
            .map_err(|e| HelmError::ConfigInvalid(e.to_string()))
            .context("validating pattern structure")
    }

    pub fn is_hub_and_spoke(&self) -> bool {
        self.agents.iter().any(|a| a.role == Some(AgentRole::Hub))
    }

    pub fn hub_agent(&self) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.role == Some(AgentRole::Hub))
    }

    pub fn worker_agents(&self) -> Vec<&AgentConfig> {
        self.agents
            .iter()
            .filter(|a| a.role != Some(AgentRole::Hub))
            .collect()
    }
}

/// Fix YAML 1.1's boolean key parsing of `on:`, `off:`, `yes:`, `no:`.
///
/// Walks `orchestrator.rules[*]` and, for any rule mapping whose `on:` key
/// was parsed as the boolean `true`, moves its value under the string key
/// `"on"` so downstream deserialization sees the expected shape.
pub fn fix_yaml_boolean_keys(value: &mut serde_yaml::Value) {
    let Some(orchestrator) = value
        .as_mapping_mut()
        .and_then(|m| m.get_mut("orchestrator"))
    else {
        return;
    };
    let Some(rules) = orchestrator
        .as_mapping_mut()
        .and_then(|m| m.get_mut("rules"))
        .and_then(|r| r.as_sequence_mut())
    else {
        return;
    };

    for rule in rules.iter_mut() {
        let Some(mapping) = rule.as_mapping_mut() else {
            continue;
        };
        if let Some(on_value) = mapping.remove(serde_yaml::Value::Bool(true)) {
            mapping.insert(serde_yaml::Value::String("on".to_string()), on_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = r#"
name: hub-spoke-demo
agents:
  - id: coordinator
    role: hub
  - id: worker-a
    role: worker
orchestrator:
  rules:
    - on: permission.requested
      if: action contains "curl"
      then: escalate
      reason: network access
limits:
  max_duration: 45s
  max_turns_per_agent: 10
"#;

    #[test]
    fn parses_bareword_on_key_as_string() {
        let config = ExperimentConfig::from_yaml_str(PATTERN).unwrap();
        assert_eq!(config.orchestrator.rules.len(), 1);
        assert_eq!(config.orchestrator.rules[0].on, "permission.requested");
        assert_eq!(
            config.orchestrator.rules[0].if_condition.as_deref(),
            Some("action contains \"curl\"")
        );
    }

    #[test]
    fn hub_and_spoke_detection() {
        let config = ExperimentConfig::from_yaml_str(PATTERN).unwrap();
        assert!(config.is_hub_and_spoke());
        assert_eq!(config.hub_agent().unwrap().id, "coordinator");
        assert_eq!(config.worker_agents().len(), 1);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_seconds("45s").unwrap(), 45);
        assert_eq!(parse_duration_seconds("2m").unwrap(), 120);
        assert_eq!(parse_duration_seconds("1h").unwrap(), 3600);
        assert_eq!(parse_duration_seconds("90").unwrap(), 90);
    }

    #[test]
    fn defaults_apply_when_sections_omitted() {
        let minimal = "name: x\nagents:\n  - id: solo\n";
        let config = ExperimentConfig::from_yaml_str(minimal).unwrap();
        assert_eq!(config.limits.max_duration, "30m");
        assert_eq!(config.limits.blocked_commands, vec!["rm -rf", "sudo"]);
        assert!(config.orchestrator.rules.is_empty());
        assert!(!config.is_hub_and_spoke());
    }
}
