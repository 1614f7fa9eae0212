//! The filesystem + nudge coordination backend.
//!
//! Agents coordinate purely by writing files under a conventional directory
//! layout; this backend turns that passive convention into an active fabric
//! by watching for new files, classifying them by path, and pushing their
//! content back into the right agents' sessions as conversational nudges.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use super::{CoordinationBackend, CoordinationMessage, CoordinationSetup, MessageSender, MessageType, BROADCAST};
use crate::session::SessionClient;

/// Cap, in bytes, on the content a nudge carries verbatim.
const DEFAULT_MAX_NUDGE_BYTES: usize = 4_000;

struct ClassifiedPath {
    message_type: MessageType,
    sender: Option<String>,
    recipient: Option<String>,
    /// Completion signals are never nudged in hub-and-spoke mode (they end
    /// the experiment); all other classifications are nudgeable.
    suppress_nudge: bool,
}

struct BackendState {
    experiment_dir: PathBuf,
    coordination_root: PathBuf,
    workspace_root: PathBuf,
    hub_and_spoke: bool,
    hub_agent_id: Option<String>,
    agent_roles: HashMap<String, String>,
    agents: Vec<String>,
    workspace_watches: Vec<String>,
    seen_coordination: Mutex<HashSet<PathBuf>>,
    seen_workspace: Mutex<HashSet<PathBuf>>,
}

impl BackendState {
    fn find_hub(&self) -> Option<String> {
        if let Some(hub) = &self.hub_agent_id {
            return Some(hub.clone());
        }
        if let Some((id, _)) = self.agent_roles.iter().find(|(_, role)| role.as_str() == "hub") {
            return Some(id.clone());
        }
        if self.hub_and_spoke {
            return self.agents.first().cloned();
        }
        None
    }

    fn hub_or_all(&self) -> String {
        self.find_hub().unwrap_or_else(|| BROADCAST.to_string())
    }
}

/// The filesystem + nudge coordination backend.
///
/// `poll_interval_millis`/`max_nudge_bytes` are atomics rather than plain
/// fields because `setup()` takes `&self` (the backend is already behind an
/// `Arc<dyn CoordinationBackend>` by the time the pattern's
/// `backend_settings` are known) and may override the construction-time
/// defaults.
pub struct FilesystemNudgeBackend {
    poll_interval_millis: AtomicU64,
    max_nudge_bytes: AtomicUsize,
    state: Mutex<Option<Arc<BackendState>>>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FilesystemNudgeBackend {
    pub fn new(poll_interval_secs: f64, max_nudge_bytes: usize) -> Self {
        Self {
            poll_interval_millis: AtomicU64::new(Duration::from_secs_f64(poll_interval_secs.max(0.01)).as_millis() as u64),
            max_nudge_bytes: AtomicUsize::new(if max_nudge_bytes == 0 {
                DEFAULT_MAX_NUDGE_BYTES
            } else {
                max_nudge_bytes
            }),
            state: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            poll_handle: Mutex::new(None),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis.load(Ordering::Relaxed))
    }

    fn max_nudge_bytes(&self) -> usize {
        self.max_nudge_bytes.load(Ordering::Relaxed)
    }
}

impl Default for FilesystemNudgeBackend {
    fn default() -> Self {
        Self::new(2.0, DEFAULT_MAX_NUDGE_BYTES)
    }
}

#[async_trait]
impl CoordinationBackend for FilesystemNudgeBackend {
    async fn setup(
        &self,
        experiment_dir: &Path,
        agents: &[String],
        config: &CoordinationSetup,
    ) -> Result<()> {
        let base = config
            .paths
            .get("base")
            .cloned()
            .unwrap_or_else(|| "coordination".to_string());
        let coordination_root = experiment_dir.join(&base);
        let workspace_root = experiment_dir.join("workspace");
        std::fs::create_dir_all(&coordination_root)
            .with_context(|| format!("creating coordination root {}", coordination_root.display()))?;
        std::fs::create_dir_all(&workspace_root)
            .with_context(|| format!("creating workspace root {}", workspace_root.display()))?;

        if let Some(secs) = config.poll_interval_secs {
            self.poll_interval_millis
                .store(Duration::from_secs_f64(secs.max(0.01)).as_millis() as u64, Ordering::Relaxed);
        }
        if let Some(bytes) = config.max_nudge_bytes {
            self.max_nudge_bytes.store(bytes.max(1), Ordering::Relaxed);
        }

        let hub_and_spoke = config.paths.contains_key("tasks");

        for (alias, relpath) in &config.paths {
            if alias == "base" {
                continue;
            }
            if is_file_like(relpath) {
                continue;
            }
            std::fs::create_dir_all(coordination_root.join(relpath))
                .with_context(|| format!("creating coordination subdirectory '{alias}'"))?;
        }

        if hub_and_spoke {
            let tasks_dir = config.paths.get("tasks").map(String::as_str).unwrap_or("tasks");
            for agent in agents {
                std::fs::create_dir_all(coordination_root.join(tasks_dir).join(agent).join("pending"))
                    .context("creating per-agent tasks/pending directory")?;
                std::fs::create_dir_all(coordination_root.join(tasks_dir).join(agent).join("completed"))
                    .context("creating per-agent tasks/completed directory")?;
            }
        }

        let seen_coordination = snapshot_files(&coordination_root);
        let seen_workspace = snapshot_glob_matches(&workspace_root, &config.workspace_watches);

        let state = BackendState {
            experiment_dir: experiment_dir.to_path_buf(),
            coordination_root,
            workspace_root,
            hub_and_spoke,
            hub_agent_id: config.hub_agent_id.clone(),
            agent_roles: config.agent_roles.clone(),
            agents: agents.to_vec(),
            workspace_watches: config.workspace_watches.clone(),
            seen_coordination: Mutex::new(seen_coordination),
            seen_workspace: Mutex::new(seen_workspace),
        };

        *self.state.lock().await = Some(Arc::new(state));
        Ok(())
    }

    fn prompt_instructions(&self, _agent_id: &str) -> String {
        "Coordinate with other agents by reading and writing files under the \
         coordination/ directory; new files you write there will be \
         delivered to the right recipients automatically."
            .to_string()
    }

    async fn start_watching(
        &self,
        sdk: Arc<SessionClient>,
        agent_sessions: HashMap<String, String>,
        messages: MessageSender,
    ) -> Result<()> {
        let Some(state) = self.state.lock().await.clone() else {
            anyhow::bail!("start_watching called before setup");
        };
        let poll_interval = self.poll_interval();
        let max_nudge_bytes = self.max_nudge_bytes();
        let stop = Arc::clone(&self.stop);
        let stop_notify = Arc::clone(&self.stop_notify);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop_notify.notified() => {}
                }
                let suppress = stop.load(Ordering::SeqCst);
                if let Err(e) = scan_once(
                    &state,
                    &sdk,
                    &agent_sessions,
                    &messages,
                    max_nudge_bytes,
                    suppress,
                )
                .await
                {
                    error!(error = %e, "coordination poll iteration failed");
                }
                if suppress {
                    break;
                }
            }
        });

        *self.poll_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop_watching(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        if let Some(handle) = self.poll_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "coordination poll task ended abnormally");
            }
        }
    }

    async fn is_complete(&self, agents: &[String]) -> bool {
        let Some(state) = self.state.lock().await.clone() else {
            return false;
        };
        let signals_dir = state.coordination_root.join("signals");
        if state.hub_and_spoke {
            signals_dir.join("done").exists()
        } else {
            !agents.is_empty()
                && agents
                    .iter()
                    .all(|a| signals_dir.join(format!("{a}.done")).exists())
        }
    }
}

fn is_file_like(relpath: &str) -> bool {
    relpath
        .rsplit('/')
        .next()
        .map(|last| last.contains('.'))
        .unwrap_or(false)
}

fn snapshot_files(root: &Path) -> HashSet<PathBuf> {
    if !root.exists() {
        return HashSet::new();
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn snapshot_glob_matches(workspace_root: &Path, patterns: &[String]) -> HashSet<PathBuf> {
    if patterns.is_empty() || !workspace_root.exists() {
        return HashSet::new();
    }
    let compiled: Vec<Pattern> = patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect();
    WalkDir::new(workspace_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let rel = e.path().strip_prefix(workspace_root).unwrap_or(e.path());
            compiled.iter().any(|p| p.matches_path(rel))
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

async fn scan_once(
    state: &BackendState,
    sdk: &Arc<SessionClient>,
    agent_sessions: &HashMap<String, String>,
    messages: &MessageSender,
    max_nudge_bytes: usize,
    suppress_delivery: bool,
) -> Result<()> {
    scan_coordination(state, sdk, agent_sessions, messages, max_nudge_bytes, suppress_delivery).await?;
    scan_workspace(state, sdk, agent_sessions, messages, max_nudge_bytes, suppress_delivery).await?;
    Ok(())
}

async fn scan_coordination(
    state: &BackendState,
    sdk: &Arc<SessionClient>,
    agent_sessions: &HashMap<String, String>,
    messages: &MessageSender,
    max_nudge_bytes: usize,
    suppress_delivery: bool,
) -> Result<()> {
    let current = snapshot_files(&state.coordination_root);
    let mut seen = state.seen_coordination.lock().await;
    let mut new_paths: Vec<PathBuf> = current.difference(&seen).cloned().collect();
    new_paths.sort();

    for path in &new_paths {
        let rel = path.strip_prefix(&state.coordination_root).unwrap_or(path);
        let Some(classified) = classify_path(rel, state) else {
            continue;
        };
        let content = std::fs::read_to_string(path).unwrap_or_default();
        let mut message = CoordinationMessage::new(
            classified.sender.clone(),
            classified.recipient.clone(),
            classified.message_type,
            content.clone(),
            Some(rel.to_string_lossy().to_string()),
        );

        let deliver = !suppress_delivery && !classified.suppress_nudge && classified.recipient.is_some();
        if deliver {
            let header = match classified.sender.as_deref() {
                Some(sender) => format!(
                    "[Coordination] {} from {}",
                    display_message_type(classified.message_type),
                    sender
                ),
                None => format!("[Coordination] {}", display_message_type(classified.message_type)),
            };
            let nudge_text = build_nudge_body(
                &header,
                &rel.to_string_lossy(),
                &content,
                max_nudge_bytes,
            );
            deliver_nudge(
                sdk,
                agent_sessions,
                classified.recipient.as_deref(),
                classified.sender.as_deref(),
                &nudge_text,
            )
            .await;
            message.delivered = true;
            message.delivery_timestamp = Some(chrono::Utc::now());
            message.nudge_text = Some(nudge_text);
        }

        let _ = messages.send(message).await;
    }

    seen.extend(current);
    Ok(())
}

async fn scan_workspace(
    state: &BackendState,
    sdk: &Arc<SessionClient>,
    agent_sessions: &HashMap<String, String>,
    messages: &MessageSender,
    max_nudge_bytes: usize,
    suppress_delivery: bool,
) -> Result<()> {
    if state.workspace_watches.is_empty() {
        return Ok(());
    }
    let current = snapshot_glob_matches(&state.workspace_root, &state.workspace_watches);
    let mut seen = state.seen_workspace.lock().await;
    let mut new_paths: Vec<PathBuf> = current.difference(&seen).cloned().collect();
    new_paths.sort();

    for path in &new_paths {
        let rel = path.strip_prefix(&state.workspace_root).unwrap_or(path);
        let content = std::fs::read_to_string(path).unwrap_or_default();
        let mut message = CoordinationMessage::new(
            None,
            Some(BROADCAST.to_string()),
            MessageType::StatusUpdate,
            content.clone(),
            Some(rel.to_string_lossy().to_string()),
        );
        message
            .metadata
            .insert("artifact".to_string(), serde_json::Value::Bool(true));

        if !suppress_delivery {
            let header = format!("[Artifact Created] {}", rel.to_string_lossy());
            let nudge_text = build_nudge_body(&header, &rel.to_string_lossy(), &content, max_nudge_bytes);
            deliver_nudge(sdk, agent_sessions, Some(BROADCAST), None, &nudge_text).await;
            message.delivered = true;
            message.delivery_timestamp = Some(chrono::Utc::now());
            message.nudge_text = Some(nudge_text);
        }

        let _ = messages.send(message).await;
    }

    seen.extend(current);
    Ok(())
}

fn classify_path(rel: &Path, state: &BackendState) -> Option<ClassifiedPath> {
    let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
    match parts.as_slice() {
        ["tasks", agent, "pending", _file] => Some(ClassifiedPath {
            message_type: MessageType::TaskAssignment,
            sender: state.find_hub(),
            recipient: Some(agent.to_string()),
            suppress_nudge: false,
        }),
        ["tasks", agent, "completed", _file] => Some(ClassifiedPath {
            message_type: MessageType::StatusUpdate,
            sender: Some(agent.to_string()),
            recipient: state.find_hub(),
            suppress_nudge: false,
        }),
        ["status", file] if file.ends_with(".json") => {
            let agent = file.trim_end_matches(".json");
            Some(ClassifiedPath {
                message_type: MessageType::StatusUpdate,
                sender: Some(agent.to_string()),
                recipient: Some(state.hub_or_all()),
                suppress_nudge: false,
            })
        }
        ["messages", file] => {
            let (sender, recipient) = parse_message_filename(file)?;
            let recipient = if recipient == "all" {
                BROADCAST.to_string()
            } else {
                recipient
            };
            Some(ClassifiedPath {
                message_type: MessageType::PeerMessage,
                sender: Some(sender),
                recipient: Some(recipient),
                suppress_nudge: false,
            })
        }
        ["signals", "done"] => Some(ClassifiedPath {
            message_type: MessageType::CompletionSignal,
            sender: None,
            recipient: if state.hub_and_spoke {
                None
            } else {
                Some(BROADCAST.to_string())
            },
            suppress_nudge: state.hub_and_spoke,
        }),
        ["signals", file] if file.ends_with(".done") => {
            let agent = file.trim_end_matches(".done");
            Some(ClassifiedPath {
                message_type: MessageType::CompletionSignal,
                sender: Some(agent.to_string()),
                recipient: if state.hub_and_spoke {
                    None
                } else {
                    Some(BROADCAST.to_string())
                },
                suppress_nudge: state.hub_and_spoke,
            })
        }
        ["decisions", _file] => Some(ClassifiedPath {
            message_type: MessageType::Decision,
            sender: state.find_hub(),
            recipient: Some(BROADCAST.to_string()),
            suppress_nudge: false,
        }),
        ["blocked", file] => {
            let agent = file.split('.').next().unwrap_or(file);
            Some(ClassifiedPath {
                message_type: MessageType::Question,
                sender: Some(agent.to_string()),
                recipient: Some(state.hub_or_all()),
                suppress_nudge: false,
            })
        }
        ["questions", _file] => Some(ClassifiedPath {
            message_type: MessageType::Question,
            sender: None,
            recipient: Some(state.hub_or_all()),
            suppress_nudge: false,
        }),
        ["reviews", _file] => Some(ClassifiedPath {
            message_type: MessageType::PeerMessage,
            sender: None,
            recipient: Some(BROADCAST.to_string()),
            suppress_nudge: false,
        }),
        _ => {
            debug!(path = %rel.display(), "file did not match any coordination path convention");
            Some(ClassifiedPath {
                message_type: MessageType::StatusUpdate,
                sender: None,
                recipient: None,
                suppress_nudge: false,
            })
        }
    }
}

/// Parse `<timestamp>-<sender>-<recipient>.md`. The timestamp itself may
/// contain hyphens, so split from the right.
fn parse_message_filename(file: &str) -> Option<(String, String)> {
    let stem = file.strip_suffix(".md")?;
    let mut parts = stem.rsplitn(3, '-');
    let recipient = parts.next()?.to_string();
    let sender = parts.next()?.to_string();
    parts.next()?;
    Some((sender, recipient))
}

fn display_message_type(t: MessageType) -> &'static str {
    match t {
        MessageType::TaskAssignment => "Task Assignment",
        MessageType::StatusUpdate => "Status Update",
        MessageType::CompletionSignal => "Completion Signal",
        MessageType::Question => "Question",
        MessageType::Decision => "Decision",
        MessageType::PeerMessage => "Peer Message",
        MessageType::Nudge => "Nudge",
    }
}

fn build_nudge_body(header: &str, source_path: &str, content: &str, max_bytes: usize) -> String {
    let body = if content.len() > max_bytes {
        format!(
            "{}\n...[truncated, see {}]",
            truncate_utf8(content, max_bytes),
            source_path
        )
    } else {
        content.to_string()
    };
    format!("{header}\nSource: {source_path}\n\n{body}\n\nAct on this information and continue your work.")
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn deliver_nudge(
    sdk: &Arc<SessionClient>,
    agent_sessions: &HashMap<String, String>,
    recipient: Option<&str>,
    sender: Option<&str>,
    nudge_text: &str,
) {
    let Some(recipient) = recipient else {
        return;
    };
    let targets: Vec<&str> = if recipient == BROADCAST {
        agent_sessions
            .keys()
            .map(String::as_str)
            .filter(|id| Some(*id) != sender)
            .collect()
    } else {
        vec![recipient]
    };

    for target in targets {
        let Some(session_id) = agent_sessions.get(target) else {
            continue;
        };
        if let Err(e) = sdk.post_message(session_id, nudge_text).await {
            warn!(agent_id = target, error = %e, "failed to deliver coordination nudge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(hub_and_spoke: bool, hub: Option<&str>) -> BackendState {
        BackendState {
            experiment_dir: PathBuf::from("/tmp/exp"),
            coordination_root: PathBuf::from("/tmp/exp/coordination"),
            workspace_root: PathBuf::from("/tmp/exp/workspace"),
            hub_and_spoke,
            hub_agent_id: hub.map(str::to_string),
            agent_roles: HashMap::new(),
            agents: vec!["worker-a".to_string(), "coordinator".to_string()],
            workspace_watches: Vec::new(),
            seen_coordination: Mutex::new(HashSet::new()),
            seen_workspace: Mutex::new(HashSet::new()),
        }
    }

    #[test]
    fn message_filename_parses_hyphenated_timestamp() {
        let (sender, recipient) = parse_message_filename("2024-01-01T00-00-00-researcher-all.md").unwrap();
        assert_eq!(sender, "researcher");
        assert_eq!(recipient, "all");
    }

    #[test]
    fn classifies_tasks_and_signals() {
        let st = state(true, Some("coordinator"));
        let c = classify_path(Path::new("tasks/worker-a/pending/001.md"), &st).unwrap();
        assert!(matches!(c.message_type, MessageType::TaskAssignment));
        assert_eq!(c.sender.as_deref(), Some("coordinator"));
        assert_eq!(c.recipient.as_deref(), Some("worker-a"));

        let c = classify_path(Path::new("signals/done"), &st).unwrap();
        assert!(c.suppress_nudge);
        assert_eq!(c.recipient, None);
    }

    #[test]
    fn unmatched_file_still_yields_an_undelivered_status_update() {
        let st = state(true, Some("coordinator"));
        let c = classify_path(Path::new("notes/random.txt"), &st).unwrap();
        assert!(matches!(c.message_type, MessageType::StatusUpdate));
        assert_eq!(c.sender, None);
        assert_eq!(c.recipient, None);
    }

    #[test]
    fn peer_mode_done_signal_broadcasts() {
        let st = state(false, None);
        let c = classify_path(Path::new("signals/worker-a.done"), &st).unwrap();
        assert!(!c.suppress_nudge);
        assert_eq!(c.recipient.as_deref(), Some(BROADCAST));
        assert_eq!(c.sender.as_deref(), Some("worker-a"));
    }

    #[test]
    fn hub_lookup_prefers_explicit_id_over_roles() {
        let mut st = state(true, Some("coordinator"));
        st.agent_roles.insert("worker-a".to_string(), "worker".to_string());
        st.agent_roles.insert("coordinator".to_string(), "hub".to_string());
        assert_eq!(st.find_hub().as_deref(), Some("coordinator"));
    }

    #[test]
    fn hub_or_all_is_broadcast_when_no_hub_exists() {
        let st = state(false, None);
        assert_eq!(st.hub_or_all(), BROADCAST);
    }

    #[test]
    fn truncation_preserves_char_boundaries() {
        let content = "a".repeat(10);
        let truncated = truncate_utf8(&content, 5);
        assert_eq!(truncated.len(), 5);
    }

    #[tokio::test]
    async fn setup_applies_backend_settings_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemNudgeBackend::default();
        assert_eq!(backend.poll_interval(), Duration::from_secs(2));
        assert_eq!(backend.max_nudge_bytes(), DEFAULT_MAX_NUDGE_BYTES);

        let config = CoordinationSetup {
            paths: HashMap::new(),
            agent_roles: HashMap::new(),
            hub_agent_id: None,
            workspace_watches: Vec::new(),
            poll_interval_secs: Some(0.5),
            max_nudge_bytes: Some(500),
        };
        backend
            .setup(dir.path(), &["solo".to_string()], &config)
            .await
            .unwrap();

        assert_eq!(backend.poll_interval(), Duration::from_millis(500));
        assert_eq!(backend.max_nudge_bytes(), 500);
    }
}
