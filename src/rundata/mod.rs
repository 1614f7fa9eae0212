//! The run-data emitter: deterministic, versioned post-run metrics
//! computed purely from `metadata.json`, `transcripts/full.json`, the
//! optional `scores.json`, and the `workspace/` tree.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::metadata::ExperimentMetadata;
use crate::transcript::Transcript;

pub const SCHEMA_VERSION: &str = "helm.run_data.v1";

/// Built-in network-access markers, independent of any
/// pattern-configured `blocked_commands`.
const RISKY_MARKERS: [&str; 9] = [
    "curl ",
    "wget ",
    "http://",
    "https://",
    "scp ",
    "rsync ",
    "ftp ",
    "nc ",
    "nmap ",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelismEfficiency {
    pub critical_path_ratio: Option<f64>,
    pub parallelism_efficiency: Option<f64>,
    pub avg_parallel_agents: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationOverhead {
    pub messages: usize,
    pub assistant_steps: usize,
    pub workspace_files: usize,
    pub messages_per_assistant_step: Option<f64>,
    pub messages_per_workspace_artifact: Option<f64>,
    pub coordination_to_output_ratio: Option<f64>,
    pub delivery_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationMetrics {
    pub escalations: usize,
    pub risky_requests: usize,
    pub hits: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvals {
    pub parallelism: ParallelismEfficiency,
    pub coordination: CoordinationOverhead,
    pub escalation: EscalationMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub metadata: Option<String>,
    pub transcript_json: Option<String>,
    pub transcript_markdown: Option<String>,
    pub scores: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
    pub task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub total_events: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub per_agent_events: HashMap<String, usize>,
    pub coordination_summary: crate::transcript::CoordinationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalsSummary {
    pub orchestration: OrchestrationEvals,
    pub judge: Option<serde_json::Value>,
}

/// The `run_data.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunData {
    pub schema_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub experiment: ExperimentSummary,
    pub run: Option<crate::controller::metadata::RunOutcome>,
    pub agents: Vec<crate::controller::metadata::AgentMetadata>,
    pub limits: crate::config::LimitsConfig,
    pub transcript: TranscriptSummary,
    pub evals: EvalsSummary,
    pub artifacts: ArtifactPaths,
}

/// Compute the run-data artifact for an experiment directory.
pub fn compute(experiment_dir: &Path) -> Result<RunData> {
    let metadata_path = experiment_dir.join("metadata.json");
    let metadata: ExperimentMetadata = serde_json::from_str(
        &std::fs::read_to_string(&metadata_path)
            .with_context(|| format!("reading {}", metadata_path.display()))?,
    )
    .context("parsing metadata.json")?;

    let transcript_path = experiment_dir.join("transcripts").join("full.json");
    let transcript: Transcript = serde_json::from_str(
        &std::fs::read_to_string(&transcript_path)
            .with_context(|| format!("reading {}", transcript_path.display()))?,
    )
    .context("parsing transcripts/full.json")?;

    let scores_path = experiment_dir.join("scores.json");
    let scores: Option<serde_json::Value> = std::fs::read_to_string(&scores_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());

    let workspace_files = count_workspace_files(&experiment_dir.join("workspace"));

    let parallelism = compute_parallelism(&transcript);
    let coordination = compute_coordination_overhead(&transcript, workspace_files);
    let escalation = compute_escalation_metrics(&transcript, &metadata);

    let per_agent_events = transcript
        .agents
        .iter()
        .map(|(id, events)| (id.clone(), events.len()))
        .collect::<HashMap<_, _>>();
    let total_events = per_agent_events.values().sum();

    Ok(RunData {
        schema_version: SCHEMA_VERSION,
        generated_at: Utc::now(),
        experiment: ExperimentSummary {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            pattern: metadata.pattern.clone(),
            created_at: metadata.created_at,
            task: metadata.task.clone(),
        },
        run: metadata.run.clone(),
        agents: metadata.agents.clone(),
        limits: metadata.limits.clone(),
        transcript: TranscriptSummary {
            total_events,
            start_time: transcript.start_time,
            end_time: transcript.end_time,
            per_agent_events,
            coordination_summary: transcript.coordination_summary.clone(),
        },
        evals: EvalsSummary {
            orchestration: OrchestrationEvals {
                parallelism,
                coordination,
                escalation,
            },
            judge: scores,
        },
        artifacts: ArtifactPaths {
            metadata: exists_relative(experiment_dir, "metadata.json"),
            transcript_json: exists_relative(experiment_dir, "transcripts/full.json"),
            transcript_markdown: exists_relative(experiment_dir, "transcripts/full.md"),
            scores: exists_relative(experiment_dir, "scores.json"),
        },
    })
}

fn exists_relative(experiment_dir: &Path, rel: &str) -> Option<String> {
    if experiment_dir.join(rel).exists() {
        Some(rel.to_string())
    } else {
        None
    }
}

fn count_workspace_files(workspace: &Path) -> usize {
    if !workspace.exists() {
        return 0;
    }
    walkdir::WalkDir::new(workspace)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

/// Extract assistant work intervals and derive the parallelism metrics.
///
/// Events carry no wire-level timestamp of their own; the collector's
/// receipt timestamp stands in for `item.started`/`item.completed` times,
/// which is faithful as long as the daemon streams events promptly.
fn compute_parallelism(transcript: &Transcript) -> ParallelismEfficiency {
    let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();

    for events in transcript.agents.values() {
        let mut starts: HashMap<String, DateTime<Utc>> = HashMap::new();
        for recorded in events {
            if recorded.event.item_role() != Some("assistant") {
                continue;
            }
            let Some(item_id) = recorded.event.item_id() else {
                if recorded.event.is_kind("item.completed") {
                    intervals.push((recorded.timestamp, recorded.timestamp));
                }
                continue;
            };
            if recorded.event.is_kind("item.started") {
                starts.insert(item_id.to_string(), recorded.timestamp);
            } else if recorded.event.is_kind("item.completed") {
                let start = starts.remove(item_id).unwrap_or(recorded.timestamp);
                let end = recorded.timestamp.max(start);
                intervals.push((start, end));
            }
        }
    }

    if intervals.is_empty() {
        return ParallelismEfficiency {
            critical_path_ratio: None,
            parallelism_efficiency: None,
            avg_parallel_agents: None,
        };
    }

    let w: f64 = intervals
        .iter()
        .map(|(s, e)| (*e - *s).num_milliseconds() as f64 / 1000.0)
        .sum();
    if w <= 0.0 {
        return ParallelismEfficiency {
            critical_path_ratio: None,
            parallelism_efficiency: None,
            avg_parallel_agents: None,
        };
    }

    let min_start = intervals.iter().map(|(s, _)| *s).min().unwrap();
    let max_end = intervals.iter().map(|(_, e)| *e).max().unwrap();
    let c = (max_end - min_start).num_milliseconds() as f64 / 1000.0;

    let critical_path_ratio = c / w;
    let parallelism_efficiency = (1.0 - critical_path_ratio).clamp(0.0, 1.0);
    let avg_parallel_agents = if c > 0.0 { w / c } else { w };

    ParallelismEfficiency {
        critical_path_ratio: Some(critical_path_ratio),
        parallelism_efficiency: Some(parallelism_efficiency),
        avg_parallel_agents: Some(avg_parallel_agents),
    }
}

fn compute_coordination_overhead(transcript: &Transcript, workspace_files: usize) -> CoordinationOverhead {
    let messages = transcript.coordination_messages.len();
    let assistant_steps: usize = transcript
        .agents
        .values()
        .flatten()
        .filter(|r| r.event.is_kind("item.completed") && r.event.item_role() == Some("assistant"))
        .count();

    let messages_per_assistant_step = if assistant_steps > 0 {
        Some(messages as f64 / assistant_steps as f64)
    } else {
        None
    };
    let messages_per_workspace_artifact = if workspace_files > 0 {
        Some(messages as f64 / workspace_files as f64)
    } else {
        None
    };
    let denom = messages + workspace_files;
    let coordination_to_output_ratio = if denom > 0 {
        Some(messages as f64 / denom as f64)
    } else {
        None
    };

    CoordinationOverhead {
        messages,
        assistant_steps,
        workspace_files,
        messages_per_assistant_step,
        messages_per_workspace_artifact,
        coordination_to_output_ratio,
        delivery_rate: transcript.coordination_summary.delivery_rate,
    }
}

fn is_risky_action(action: &str, blocked_commands: &[String]) -> bool {
    let lower = action.to_lowercase();
    if RISKY_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    blocked_commands
        .iter()
        .any(|b| !b.is_empty() && lower.contains(&b.to_lowercase()))
}

fn compute_escalation_metrics(transcript: &Transcript, metadata: &ExperimentMetadata) -> EscalationMetrics {
    let blocked = &metadata.limits.blocked_commands;
    let empty: Vec<crate::controller::metadata::EscalationRecord> = Vec::new();
    let escalation_records = metadata.run.as_ref().map(|r| &r.escalations).unwrap_or(&empty);

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut risky_with_id: HashSet<String> = HashSet::new();
    let mut risky_without_id = 0usize;

    for recorded in transcript.agents.values().flatten() {
        if !recorded.event.is_kind("permission.requested") {
            continue;
        }
        let action = recorded.event.action();
        if let Some(pid) = recorded.event.permission_id() {
            if !seen_ids.insert(pid.to_string()) {
                continue;
            }
            if is_risky_action(action, blocked) {
                risky_with_id.insert(pid.to_string());
            }
        } else if is_risky_action(action, blocked) {
            risky_without_id += 1;
        }
    }

    let risky_requests = risky_with_id.len() + risky_without_id;
    let escalations = escalation_records.len();

    let mut hits = 0usize;
    let mut used_without_id = 0usize;
    for escalation in escalation_records {
        if let Some(pid) = &escalation.permission_id {
            if risky_with_id.contains(pid) {
                hits += 1;
            }
        } else if let Some(action) = &escalation.action {
            if is_risky_action(action, blocked) && used_without_id < risky_without_id {
                hits += 1;
                used_without_id += 1;
            }
        }
    }

    let precision = if escalations > 0 {
        Some(hits as f64 / escalations as f64)
    } else {
        None
    };
    let recall = if risky_requests > 0 {
        Some(hits as f64 / risky_requests as f64)
    } else {
        None
    };

    EscalationMetrics {
        escalations,
        risky_requests,
        hits,
        precision,
        recall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationMessage, MessageType};
    use crate::event::Event;
    use crate::transcript::RecordedEvent;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn recorded(offset_ms: i64, event: Event) -> RecordedEvent {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        RecordedEvent {
            timestamp: epoch + chrono::Duration::milliseconds(offset_ms),
            event,
        }
    }

    #[test]
    fn parallelism_efficiency_matches_worked_example() {
        let mut agents = Map::new();
        agents.insert(
            "agent-a".to_string(),
            vec![
                recorded(
                    0,
                    Event::new(
                        "item.started",
                        json!({"item": {"role": "assistant", "item_id": "1"}}),
                    ),
                ),
                recorded(
                    2000,
                    Event::new(
                        "item.completed",
                        json!({"item": {"role": "assistant", "item_id": "1"}}),
                    ),
                ),
            ],
        );
        agents.insert(
            "agent-b".to_string(),
            vec![
                recorded(
                    500,
                    Event::new(
                        "item.started",
                        json!({"item": {"role": "assistant", "item_id": "2"}}),
                    ),
                ),
                recorded(
                    1500,
                    Event::new(
                        "item.completed",
                        json!({"item": {"role": "assistant", "item_id": "2"}}),
                    ),
                ),
            ],
        );

        let transcript = Transcript {
            agents,
            coordination_messages: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            coordination_summary: Default::default(),
        };

        let result = compute_parallelism(&transcript);
        assert!((result.critical_path_ratio.unwrap() - 0.6667).abs() < 0.001);
        assert!((result.parallelism_efficiency.unwrap() - 0.3333).abs() < 0.001);
        assert!((result.avg_parallel_agents.unwrap() - 1.5).abs() < 0.001);
    }

    #[test]
    fn escalation_precision_recall_perfect_match() {
        let mut agents = Map::new();
        agents.insert(
            "agent-a".to_string(),
            vec![
                recorded(
                    0,
                    Event::new(
                        "permission.requested",
                        json!({"permission_id": "p1", "action": "curl https://example.com"}),
                    ),
                ),
                recorded(
                    1,
                    Event::new(
                        "permission.requested",
                        json!({"permission_id": "p2", "action": "ls -la"}),
                    ),
                ),
            ],
        );
        let transcript = Transcript {
            agents,
            coordination_messages: vec![CoordinationMessage::new(
                None,
                None,
                MessageType::PeerMessage,
                String::new(),
                None,
            )],
            start_time: Utc::now(),
            end_time: None,
            coordination_summary: Default::default(),
        };

        let mut metadata = test_metadata();
        metadata.run = Some(test_run_outcome(vec![crate::controller::metadata::EscalationRecord {
            timestamp: Utc::now(),
            agent_id: "agent-a".to_string(),
            reason: "network access".to_string(),
            permission_id: Some("p1".to_string()),
            action: None,
        }]));

        let result = compute_escalation_metrics(&transcript, &metadata);
        assert_eq!(result.escalations, 1);
        assert_eq!(result.risky_requests, 1);
        assert_eq!(result.hits, 1);
        assert_eq!(result.precision, Some(1.0));
        assert_eq!(result.recall, Some(1.0));
    }

    fn test_metadata() -> ExperimentMetadata {
        ExperimentMetadata {
            id: "exp-1".to_string(),
            name: "demo".to_string(),
            pattern: "hub_and_spoke".to_string(),
            created_at: Utc::now(),
            agents: Vec::new(),
            limits: crate::config::LimitsConfig::default(),
            task: None,
            run: None,
        }
    }

    fn test_run_outcome(
        escalations: Vec<crate::controller::metadata::EscalationRecord>,
    ) -> crate::controller::metadata::RunOutcome {
        crate::controller::metadata::RunOutcome {
            success: true,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 0.0,
            error: None,
            agent_stats: Map::new(),
            ended_by_turn_limit: false,
            escalations,
            stream_errors: Map::new(),
        }
    }

    #[test]
    fn coordination_overhead_divides_by_zero_safely() {
        let transcript = Transcript {
            agents: Map::new(),
            coordination_messages: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            coordination_summary: Default::default(),
        };
        let overhead = compute_coordination_overhead(&transcript, 0);
        assert_eq!(overhead.messages_per_assistant_step, None);
        assert_eq!(overhead.coordination_to_output_ratio, None);
    }
}
