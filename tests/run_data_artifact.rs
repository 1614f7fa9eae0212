//! End-to-end exercise of the run-data emitter against a hand-built
//! experiment directory, the way a completed `helm run` would leave one on
//! disk: `metadata.json`, `transcripts/full.json`, a `workspace/` tree, and
//! no `scores.json` (the judge never ran).

use std::fs;

use chrono::Utc;
use helm_runtime::rundata;
use tempfile::tempdir;

fn write_metadata(dir: &std::path::Path) {
    let metadata = serde_json::json!({
        "id": "demo-abc12345",
        "name": "demo",
        "pattern": "hub_and_spoke",
        "created_at": Utc::now(),
        "agents": [
            {"id": "coordinator", "role": "hub", "harness": "claude-code"},
            {"id": "worker-a", "role": "worker", "harness": "claude-code"}
        ],
        "limits": {
            "max_duration": "30m",
            "max_turns_per_agent": 50,
            "max_budget_usd": 15.0,
            "blocked_commands": ["rm -rf", "sudo"],
            "workspace_files": {}
        },
        "task": "build a thing",
        "run": {
            "success": true,
            "start_time": Utc::now(),
            "end_time": Utc::now(),
            "duration_seconds": 12.0,
            "error": null,
            "agent_stats": {"coordinator": {"turns": 3}, "worker-a": {"turns": 2}},
            "ended_by_turn_limit": false,
            "escalations": [
                {
                    "timestamp": Utc::now(),
                    "agent_id": "worker-a",
                    "reason": "network access",
                    "permission_id": "perm-1",
                    "action": null
                }
            ],
            "stream_errors": {}
        }
    });
    fs::write(
        dir.join("metadata.json"),
        serde_json::to_string_pretty(&metadata).unwrap(),
    )
    .unwrap();
}

fn write_transcript(dir: &std::path::Path) {
    let event_started = |item_id: &str| {
        serde_json::json!({"type": "item.started", "data": {"item": {"role": "assistant", "item_id": item_id}}})
    };
    let event_completed = |item_id: &str| {
        serde_json::json!({"type": "item.completed", "data": {"item": {"role": "assistant", "item_id": item_id}}})
    };
    let permission_requested = |pid: &str, action: &str| {
        serde_json::json!({"type": "permission.requested", "data": {"permission_id": pid, "action": action}})
    };

    let base = Utc::now();
    let stamp = |offset_ms: i64| (base + chrono::Duration::milliseconds(offset_ms)).to_rfc3339();

    let transcript = serde_json::json!({
        "agents": {
            "coordinator": [
                {"timestamp": stamp(0), "event": event_started("1")},
                {"timestamp": stamp(2000), "event": event_completed("1")},
                {"timestamp": stamp(2100), "event": permission_requested("perm-1", "curl https://example.com")},
                {"timestamp": stamp(2200), "event": permission_requested("perm-2", "ls -la")}
            ],
            "worker-a": [
                {"timestamp": stamp(500), "event": event_started("2")},
                {"timestamp": stamp(1500), "event": event_completed("2")}
            ]
        },
        "coordination_messages": [
            {
                "timestamp": stamp(100),
                "sender": "coordinator",
                "recipient": "worker-a",
                "message_type": "task_assignment",
                "content": "do the thing",
                "source_path": "tasks/worker-a/pending/001.md",
                "delivered": true,
                "delivery_timestamp": stamp(100),
                "nudge_text": "[Coordination] Task Assignment from coordinator\n...",
                "metadata": {}
            }
        ],
        "start_time": stamp(0),
        "end_time": stamp(2200),
        "coordination_summary": {
            "total": 1,
            "delivered": 1,
            "delivery_rate": 1.0,
            "by_type": {"task_assignment": 1}
        }
    });

    fs::create_dir_all(dir.join("transcripts")).unwrap();
    fs::write(
        dir.join("transcripts").join("full.json"),
        serde_json::to_string_pretty(&transcript).unwrap(),
    )
    .unwrap();
}

#[test]
fn computes_run_data_from_a_completed_experiment_directory() {
    let tmp = tempdir().unwrap();
    let experiment_dir = tmp.path();

    write_metadata(experiment_dir);
    write_transcript(experiment_dir);
    fs::create_dir_all(experiment_dir.join("workspace").join("src")).unwrap();
    fs::write(experiment_dir.join("workspace").join("src").join("main.rs"), "fn main() {}").unwrap();
    fs::write(experiment_dir.join("workspace").join("README.md"), "hi").unwrap();

    let run_data = rundata::compute(experiment_dir).expect("run-data computation should succeed");

    assert_eq!(run_data.schema_version, "helm.run_data.v1");
    assert_eq!(run_data.experiment.id, "demo-abc12345");
    assert_eq!(run_data.experiment.pattern, "hub_and_spoke");
    assert!(run_data.run.as_ref().unwrap().success);

    let parallelism = &run_data.evals.orchestration.parallelism;
    assert!((parallelism.critical_path_ratio.unwrap() - 0.6667).abs() < 0.001);
    assert!((parallelism.parallelism_efficiency.unwrap() - 0.3333).abs() < 0.001);
    assert!((parallelism.avg_parallel_agents.unwrap() - 1.5).abs() < 0.001);

    let coordination = &run_data.evals.orchestration.coordination;
    assert_eq!(coordination.messages, 1);
    assert_eq!(coordination.workspace_files, 2);
    assert_eq!(coordination.assistant_steps, 2);

    let escalation = &run_data.evals.orchestration.escalation;
    assert_eq!(escalation.escalations, 1);
    assert_eq!(escalation.risky_requests, 1);
    assert_eq!(escalation.hits, 1);
    assert_eq!(escalation.precision, Some(1.0));
    assert_eq!(escalation.recall, Some(1.0));

    assert!(run_data.artifacts.metadata.is_some());
    assert!(run_data.artifacts.transcript_json.is_some());
    assert!(run_data.artifacts.scores.is_none());
}

#[test]
fn missing_metadata_is_a_clear_error() {
    let tmp = tempdir().unwrap();
    let err = rundata::compute(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("metadata.json"));
}
