//! The experiment controller: owns the whole run lifecycle — setup,
//! session creation, event fan-in, turn-budget enforcement, completion
//! detection, teardown, and artifact emission.

pub mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentState;
use crate::config::{AgentRole, ExperimentConfig};
use crate::coordination::{self, CoordinationBackend, CoordinationSetup};
use crate::event::Event;
use crate::guard::{EscalationNotice, RuntimeGuard};
use crate::session::{SdkConfig, SessionClient, SessionConfig};
use crate::transcript::Collector;
use metadata::{EscalationRecord, ExperimentMetadata, RunOutcome};

/// What a turn-budget handler decided when an agent hit its limit.
#[derive(Debug, Clone)]
pub enum TurnLimitDecision {
    Continue,
    Extend(u32),
    KillAgent,
    EndExperiment,
}

/// `(agent_id, turns, limit) -> decision`. Runs on a blocking worker thread
/// so an interactive implementation does not stall the completion-wait loop.
pub type TurnLimitHandler = Arc<dyn Fn(&str, u32, u32) -> TurnLimitDecision + Send + Sync>;

fn default_turn_limit_handler() -> TurnLimitHandler {
    Arc::new(|_agent_id, _turns, _limit| TurnLimitDecision::EndExperiment)
}

/// Outcome of a completed (or stopped) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub experiment_id: String,
    pub experiment_dir: PathBuf,
    pub success: bool,
    pub error: Option<String>,
}

struct StreamState {
    stream_errors: DashMap<String, String>,
    ended: DashSet<String>,
}

/// Owns a single experiment run end to end.
pub struct ExperimentController {
    config: ExperimentConfig,
    experiment_id: String,
    experiment_dir: PathBuf,
    sdk_config: SdkConfig,
    turn_limit_handler: TurnLimitHandler,
    stop_flag: Arc<AtomicBool>,
}

impl ExperimentController {
    pub fn new(
        config: ExperimentConfig,
        sdk_config: SdkConfig,
        experiments_dir: &Path,
        turn_limit_handler: Option<TurnLimitHandler>,
    ) -> Self {
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        let experiment_id = format!("{}-{}", config.name, suffix);
        let experiment_dir = experiments_dir.join(&experiment_id);
        Self {
            config,
            experiment_id,
            experiment_dir,
            sdk_config,
            turn_limit_handler: turn_limit_handler.unwrap_or_else(default_turn_limit_handler),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    /// Request the run stop at the next completion-wait tick / event.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Run the experiment to completion (or until stopped/timed out) with
    /// the given opening task, returning the classified outcome.
    pub async fn run(&self, task: &str) -> Result<RunResult> {
        let workspace_dir = self.experiment_dir.join("workspace");
        let transcripts_dir = self.experiment_dir.join("transcripts");
        std::fs::create_dir_all(&workspace_dir).context("creating workspace directory")?;
        std::fs::create_dir_all(&transcripts_dir).context("creating transcripts directory")?;

        self.stage_workspace_files(&workspace_dir).await?;

        let mut snapshot = ExperimentMetadata::new_snapshot(&self.experiment_id, &self.config);
        snapshot.task = Some(task.to_string());
        self.write_metadata(&snapshot)?;

        let backend = coordination::create_backend(&self.config.coordination.mechanism)?;
        let agent_ids: Vec<String> = self.config.agents.iter().map(|a| a.id.clone()).collect();
        let agent_roles: HashMap<String, String> = self
            .config
            .agents
            .iter()
            .map(|a| (a.id.clone(), a.role.unwrap_or(AgentRole::Peer).as_str().to_string()))
            .collect();
        let hub_agent_id = self.config.hub_agent().map(|a| a.id.clone());

        let mut paths = HashMap::new();
        paths.insert("base".to_string(), self.config.coordination.paths.base.clone());
        for (alias, value) in [
            ("tasks", &self.config.coordination.paths.tasks),
            ("status", &self.config.coordination.paths.status),
            ("blocked", &self.config.coordination.paths.blocked),
            ("questions", &self.config.coordination.paths.questions),
            ("decisions", &self.config.coordination.paths.decisions),
            ("messages", &self.config.coordination.paths.messages),
            ("state", &self.config.coordination.paths.state),
            ("signals", &self.config.coordination.paths.signals),
            ("reviews", &self.config.coordination.paths.reviews),
        ] {
            if let Some(v) = value {
                paths.insert(alias.to_string(), v.clone());
            } else {
                // Default relative directory names so the backend always has
                // somewhere to classify against, even when the pattern
                // omits the section.
                paths.insert(alias.to_string(), alias.to_string());
            }
        }

        let workspace_watches: Vec<String> = self
            .config
            .coordination
            .backend_settings
            .get("workspace_watches")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let poll_interval_secs = self
            .config
            .coordination
            .backend_settings
            .get("poll_interval_seconds")
            .and_then(|v| v.as_f64());
        let max_nudge_bytes = self
            .config
            .coordination
            .backend_settings
            .get("max_nudge_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        let setup = CoordinationSetup {
            paths,
            agent_roles,
            hub_agent_id: hub_agent_id.clone(),
            workspace_watches,
            poll_interval_secs,
            max_nudge_bytes,
        };
        backend
            .setup(&self.experiment_dir, &agent_ids, &setup)
            .await
            .context("setting up coordination backend")?;

        let session = Arc::new(SessionClient::new(self.sdk_config.clone()));
        session.start().await.context("starting agent-session daemon")?;

        let collector = Arc::new(Collector::new());
        let agents: Arc<DashMap<String, AgentState>> = Arc::new(DashMap::new());
        let escalations: Arc<Mutex<Vec<EscalationRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::clone(&self.stop_flag);

        let escalations_for_cb = Arc::clone(&escalations);
        let stop_flag_for_cb = Arc::clone(&stop_flag);
        let escalation_handler: crate::guard::EscalationHandler =
            Arc::new(move |notice: EscalationNotice| {
                let record = EscalationRecord {
                    timestamp: Utc::now(),
                    agent_id: notice.agent_id.clone(),
                    reason: notice.reason.clone(),
                    permission_id: notice.event.permission_id().map(str::to_string),
                    action: if notice.event.action().is_empty() {
                        None
                    } else {
                        Some(notice.event.action().to_string())
                    },
                };
                eprintln!(
                    "[helm] escalation: agent={} reason={}",
                    record.agent_id, record.reason
                );
                escalations_for_cb
                    .lock()
                    .expect("escalations mutex poisoned")
                    .push(record);
                stop_flag_for_cb.store(true, Ordering::SeqCst);
            });

        // Create sessions in role-aware order, seeding each with its first
        // message, then build the guard (it needs `agents` populated so
        // `from:` role matching works from the very first event).
        self.create_sessions(&session, &agents, &collector, task, &backend).await?;

        let guard = Arc::new(RuntimeGuard::new(
            self.config.orchestrator.rules.clone(),
            Arc::clone(&agents),
            Arc::clone(&session),
            hub_agent_id.clone(),
            Some(escalation_handler),
        ));

        let agent_sessions: HashMap<String, String> = agents
            .iter()
            .map(|e| (e.key().clone(), e.value().session_id.clone()))
            .collect();

        let (message_tx, message_rx) = async_channel::bounded(1024);
        let collector_for_messages = Arc::clone(&collector);
        let message_drain_handle = tokio::spawn(async move {
            while let Ok(message) = message_rx.recv().await {
                collector_for_messages.record_message(message).await;
            }
        });
        backend
            .start_watching(Arc::clone(&session), agent_sessions, message_tx)
            .await
            .context("starting coordination backend poll loop")?;

        let stream_state = Arc::new(StreamState {
            stream_errors: DashMap::new(),
            ended: DashSet::new(),
        });
        let mut stream_handles: Vec<JoinHandle<()>> = Vec::new();
        for agent_id in &agent_ids {
            let handle = self.spawn_event_stream(
                agent_id.clone(),
                Arc::clone(&session),
                Arc::clone(&agents),
                Arc::clone(&collector),
                Arc::clone(&guard),
                Arc::clone(&stream_state),
                self.config.limits.blocked_commands.clone(),
                self.experiment_dir.clone(),
            );
            stream_handles.push(handle);
        }

        let ended_by_turn_limit = Arc::new(AtomicBool::new(false));
        let turn_limits: Arc<DashMap<String, Option<u32>>> = Arc::new(DashMap::new());
        for agent_id in &agent_ids {
            turn_limits.insert(agent_id.clone(), Some(self.config.limits.max_turns_per_agent));
        }

        let max_duration = self.config.limits.duration_seconds().unwrap_or(1800);
        self.wait_for_completion(
            &backend,
            &agent_ids,
            &stream_state,
            &guard,
            &turn_limits,
            &ended_by_turn_limit,
            max_duration,
        )
        .await;

        // Teardown always runs regardless of how the wait exited. `teardown`
        // joins the poll task, which drops its `message_tx` end, so the
        // drain task below is guaranteed to observe a closed channel and
        // exit after flushing whatever it already received.
        backend.teardown().await;
        let _ = message_drain_handle.await;
        guard.stop();
        for agent_id in &agent_ids {
            if let Some(state) = agents.get(agent_id) {
                let _ = session.terminate_session(&state.session_id).await;
            }
        }
        session.dispose().await;
        for handle in stream_handles {
            handle.abort();
        }

        collector.finish().await;
        let transcript = collector.to_transcript().await;
        std::fs::write(
            transcripts_dir.join("full.json"),
            serde_json::to_string_pretty(&transcript)?,
        )
        .context("writing transcripts/full.json")?;
        std::fs::write(transcripts_dir.join("full.md"), transcript.render_markdown())
            .context("writing transcripts/full.md")?;

        let (success, error) = self.classify_outcome(
            &stream_state,
            &escalations,
            ended_by_turn_limit.load(Ordering::SeqCst),
            &backend,
            &agent_ids,
        )
        .await;

        let agent_stats = agents
            .iter()
            .map(|e| (e.key().clone(), metadata::AgentStat { turns: e.value().turn_count }))
            .collect();

        snapshot.run = Some(RunOutcome {
            success,
            start_time: transcript.start_time,
            end_time: transcript.end_time.unwrap_or_else(Utc::now),
            duration_seconds: transcript
                .end_time
                .map(|e| (e - transcript.start_time).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0),
            error: error.clone(),
            agent_stats,
            ended_by_turn_limit: ended_by_turn_limit.load(Ordering::SeqCst),
            escalations: escalations.lock().expect("escalations mutex poisoned").clone(),
            stream_errors: stream_state
                .stream_errors
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        });
        self.write_metadata(&snapshot)?;

        match crate::rundata::compute(&self.experiment_dir) {
            Ok(run_data) => {
                let _ = std::fs::write(
                    self.experiment_dir.join("run_data.json"),
                    serde_json::to_string_pretty(&run_data)?,
                );
            }
            Err(e) => warn!(error = %e, "failed to compute run-data artifact"),
        }

        Ok(RunResult {
            experiment_id: self.experiment_id.clone(),
            experiment_dir: self.experiment_dir.clone(),
            success,
            error,
        })
    }

    fn write_metadata(&self, metadata: &ExperimentMetadata) -> Result<()> {
        std::fs::write(
            self.experiment_dir.join("metadata.json"),
            serde_json::to_string_pretty(metadata)?,
        )
        .context("writing metadata.json")
    }

    async fn stage_workspace_files(&self, workspace_dir: &Path) -> Result<()> {
        let http = reqwest::Client::new();
        for (name, source) in &self.config.limits.workspace_files {
            let dest = workspace_dir.join(name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            if source.starts_with("http://") || source.starts_with("https://") {
                let bytes = http
                    .get(source)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .context("fetching workspace file")?
                    .bytes()
                    .await
                    .context("reading workspace file response body")?;
                std::fs::write(&dest, &bytes)
                    .map_err(|e| crate::error::HelmError::StageFailed(name.clone(), e.to_string()))?;
            } else {
                std::fs::copy(source, &dest)
                    .map_err(|e| crate::error::HelmError::StageFailed(name.clone(), e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn create_sessions(
        &self,
        session: &Arc<SessionClient>,
        agents: &Arc<DashMap<String, AgentState>>,
        collector: &Arc<Collector>,
        task: &str,
        backend: &Arc<dyn CoordinationBackend>,
    ) -> Result<()> {
        let register = |agent_id: &str, session_id: &str, role: AgentRole| {
            agents.insert(
                agent_id.to_string(),
                AgentState::new(agent_id, session_id, role),
            );
        };

        let coordination_dir = self.experiment_dir.join(&self.config.coordination.paths.base);
        let workspace_dir = self.experiment_dir.join("workspace");

        let first_message = |agent_id: &str, system_prompt: &str, body: &str| -> String {
            let mut msg = String::new();
            if !system_prompt.is_empty() {
                msg.push_str(system_prompt);
                msg.push_str("\n\n");
            }
            msg.push_str(&format!(
                "## Environment\n- working_directory: {}\n- agent_id: {}\n- coordination_directory: {}\n- workspace_directory: {}\n\n",
                self.experiment_dir.display(),
                agent_id,
                coordination_dir.display(),
                workspace_dir.display(),
            ));
            let instructions = backend.prompt_instructions(agent_id);
            if !instructions.is_empty() {
                msg.push_str(&instructions);
                msg.push_str("\n\n");
            }
            msg.push_str("## Task\n");
            msg.push_str(body);
            msg
        };

        if self.config.is_hub_and_spoke() {
            let hub = self
                .config
                .hub_agent()
                .context("hub-and-spoke pattern declared but no agent has role: hub")?;
            let hub_session_id = format!("session-{}", hub.id);
            session
                .create_session(&hub_session_id, &SessionConfig {
                    agent: hub.harness.clone(),
                    permission_mode: "bypass".to_string(),
                    allowed_commands: None,
                    cwd: Some(self.experiment_dir.display().to_string()),
                })
                .await
                .context("creating hub session")?;
            register(&hub.id, &hub_session_id, AgentRole::Hub);
            let message = first_message(&hub.id, &hub.system_prompt, task);
            session.post_message(&hub_session_id, &message).await?;
            collector.record(&hub.id, Event::new("session.started", serde_json::json!({})));

            for worker in self.config.worker_agents() {
                let worker_session_id = format!("session-{}", worker.id);
                session
                    .create_session(&worker_session_id, &SessionConfig {
                        agent: worker.harness.clone(),
                        permission_mode: "bypass".to_string(),
                        allowed_commands: None,
                        cwd: Some(self.experiment_dir.display().to_string()),
                    })
                    .await
                    .context("creating worker session")?;
                register(&worker.id, &worker_session_id, worker.role.unwrap_or(AgentRole::Worker));
                let message = first_message(
                    &worker.id,
                    &worker.system_prompt,
                    "You are now active. Check your task queue for assignments.",
                );
                session.post_message(&worker_session_id, &message).await?;
                collector.record(&worker.id, Event::new("session.started", serde_json::json!({})));
            }
        } else {
            for peer in &self.config.agents {
                let peer_session_id = format!("session-{}", peer.id);
                session
                    .create_session(&peer_session_id, &SessionConfig {
                        agent: peer.harness.clone(),
                        permission_mode: "bypass".to_string(),
                        allowed_commands: None,
                        cwd: Some(self.experiment_dir.display().to_string()),
                    })
                    .await
                    .context("creating peer session")?;
                register(&peer.id, &peer_session_id, peer.role.unwrap_or(AgentRole::Peer));
                let message = first_message(&peer.id, &peer.system_prompt, task);
                session.post_message(&peer_session_id, &message).await?;
                collector.record(&peer.id, Event::new("session.started", serde_json::json!({})));
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_event_stream(
        &self,
        agent_id: String,
        session: Arc<SessionClient>,
        agents: Arc<DashMap<String, AgentState>>,
        collector: Arc<Collector>,
        guard: Arc<RuntimeGuard>,
        stream_state: Arc<StreamState>,
        blocked_commands: Vec<String>,
        experiment_dir: PathBuf,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let session_id = match agents.get(&agent_id) {
                Some(state) => state.session_id.clone(),
                None => return,
            };
            let mut stream = match session.open_event_stream(&session_id) {
                Ok(s) => s,
                Err(e) => {
                    stream_state.stream_errors.insert(agent_id.clone(), e.to_string());
                    stream_state.ended.insert(agent_id.clone());
                    return;
                }
            };

            loop {
                match stream.next_event().await {
                    None => break,
                    Some(event) => {
                        collector.record(&agent_id, event.clone());
                        let rule_matched = guard.handle_event(&agent_id, &event).await;

                        if event.is_kind("permission.requested")
                            && !rule_matched
                            && is_auto_approvable(&event, &experiment_dir, &blocked_commands)
                        {
                            if let Some(permission_id) = event.permission_id() {
                                let _ = session.reply_permission(&session_id, permission_id, "once").await;
                            }
                        }

                        if event_signals_completion(&event, &agent_id) || event.is_kind("session.ended") {
                            break;
                        }
                    }
                }
            }

            stream_state.ended.insert(agent_id);
        })
    }

    async fn wait_for_completion(
        &self,
        backend: &Arc<dyn CoordinationBackend>,
        agent_ids: &[String],
        stream_state: &Arc<StreamState>,
        guard: &Arc<RuntimeGuard>,
        turn_limits: &Arc<DashMap<String, Option<u32>>>,
        ended_by_turn_limit: &Arc<AtomicBool>,
        max_duration_secs: u64,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(max_duration_secs);

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if backend.is_complete(agent_ids).await {
                break;
            }
            if stream_state.ended.len() >= agent_ids.len() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            for agent_id in agent_ids {
                let Some(limit) = turn_limits.get(agent_id).map(|l| *l) else {
                    continue;
                };
                let Some(limit) = limit else { continue };
                let turns = guard.turn_count(agent_id);
                if turns < limit {
                    continue;
                }

                let handler = Arc::clone(&self.turn_limit_handler);
                let agent_id_owned = agent_id.clone();
                let decision = tokio::task::spawn_blocking(move || handler(&agent_id_owned, turns, limit))
                    .await
                    .unwrap_or(TurnLimitDecision::EndExperiment);

                match decision {
                    TurnLimitDecision::Continue => {
                        turn_limits.insert(agent_id.clone(), None);
                    }
                    TurnLimitDecision::Extend(n) => {
                        turn_limits.insert(agent_id.clone(), Some(turns + n));
                    }
                    TurnLimitDecision::KillAgent => {
                        stream_state.ended.insert(agent_id.clone());
                    }
                    TurnLimitDecision::EndExperiment => {
                        ended_by_turn_limit.store(true, Ordering::SeqCst);
                        self.stop_flag.store(true, Ordering::SeqCst);
                    }
                }
            }
            if ended_by_turn_limit.load(Ordering::SeqCst) {
                break;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn classify_outcome(
        &self,
        stream_state: &Arc<StreamState>,
        escalations: &Arc<Mutex<Vec<EscalationRecord>>>,
        ended_by_turn_limit: bool,
        backend: &Arc<dyn CoordinationBackend>,
        agent_ids: &[String],
    ) -> (bool, Option<String>) {
        if !stream_state.stream_errors.is_empty() {
            let joined = stream_state
                .stream_errors
                .iter()
                .map(|e| format!("{}: {}", e.key(), e.value()))
                .collect::<Vec<_>>()
                .join("; ");
            return (false, Some(format!("event stream(s) failed: {joined}")));
        }
        if !escalations.lock().expect("escalations mutex poisoned").is_empty() {
            return (
                false,
                Some("Escalation required human input and the run was paused".to_string()),
            );
        }
        if ended_by_turn_limit {
            return (false, Some("run ended by turn-budget limit".to_string()));
        }
        if !backend.is_complete(agent_ids).await {
            let reason = if self.stop_flag.load(Ordering::SeqCst) {
                "run was stopped before completion signals were observed"
            } else {
                "run ended before completion signals were observed"
            };
            return (false, Some(reason.to_string()));
        }
        (true, None)
    }
}

fn is_auto_approvable(event: &Event, experiment_dir: &Path, blocked_commands: &[String]) -> bool {
    let action = event.action();
    let lower = action.to_lowercase();
    if blocked_commands
        .iter()
        .any(|b| !b.is_empty() && lower.contains(&b.to_lowercase()))
    {
        return false;
    }
    let dir = experiment_dir.to_string_lossy();
    action.contains(dir.as_ref()) || action.contains("workspace/") || action.contains("coordination/")
}

fn event_signals_completion(event: &Event, agent_id: &str) -> bool {
    if !event.is_kind("item.completed") {
        return false;
    }
    let all_signal = format!("signals/{agent_id}.done");
    event
        .referenced_file_paths()
        .iter()
        .any(|p| p.ends_with("signals/done") || p.ends_with(all_signal.as_str()))
}

impl Drop for ExperimentController {
    fn drop(&mut self) {
        if !self.stop_flag.load(Ordering::SeqCst) {
            info!(experiment_id = %self.experiment_id, "experiment controller dropped without an explicit stop");
        }
    }
}
