//! Pluggable coordination backends.
//!
//! The coordination package abstracts inter-agent communication so that
//! different mechanisms can be swapped via the pattern YAML's
//! `coordination.mechanism` field. Only the filesystem + nudge backend is
//! implemented; the trait stays free of filesystem-specific vocabulary so a
//! future in-memory or webhook backend can satisfy it without touching call
//! sites.

pub mod filesystem;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionClient;

/// Types of coordination messages between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    StatusUpdate,
    CompletionSignal,
    Question,
    Decision,
    PeerMessage,
    Nudge,
}

/// Recipient sentinel meaning "every other agent".
pub const BROADCAST: &str = "__all__";

/// A single coordination event observed by a backend.
///
/// `content` always carries the full body even when `nudge_text` (the text
/// actually injected into an agent's session) is truncated — truncation is a
/// view, not a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub timestamp: DateTime<Utc>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub source_path: Option<String>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub delivery_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nudge_text: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CoordinationMessage {
    pub fn new(
        sender: Option<String>,
        recipient: Option<String>,
        message_type: MessageType,
        content: String,
        source_path: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            sender,
            recipient,
            message_type,
            content,
            source_path,
            delivered: false,
            delivery_timestamp: None,
            nudge_text: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Channel a backend pushes each observed coordination message into. A
/// bounded `async_channel` (rather than a plain callback) so a burst of
/// newly classified files backpressures against a slow consumer instead of
/// piling up `tokio::spawn`ed tasks.
pub type MessageSender = async_channel::Sender<CoordinationMessage>;

/// Full setup configuration handed to a backend, derived from the pattern's
/// `coordination` section plus role metadata the controller already knows.
#[derive(Debug, Clone, Default)]
pub struct CoordinationSetup {
    pub paths: HashMap<String, String>,
    pub agent_roles: HashMap<String, String>,
    pub hub_agent_id: Option<String>,
    pub workspace_watches: Vec<String>,
    pub poll_interval_secs: Option<f64>,
    pub max_nudge_bytes: Option<usize>,
}

/// Interface every coordination mechanism must implement.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Initialize the coordination environment (directories, queues, ...).
    async fn setup(
        &self,
        experiment_dir: &Path,
        agents: &[String],
        config: &CoordinationSetup,
    ) -> Result<()>;

    /// Instructions to inject into an agent's prompt, or empty if the
    /// backend relies entirely on prompts the pattern author already wrote.
    fn prompt_instructions(&self, agent_id: &str) -> String;

    /// Begin monitoring for coordination events and delivering nudges.
    async fn start_watching(
        &self,
        sdk: Arc<SessionClient>,
        agent_sessions: HashMap<String, String>,
        messages: MessageSender,
    ) -> Result<()>;

    /// Stop the monitoring loop.
    async fn stop_watching(&self);

    /// Whether the coordination protocol signals that work is done.
    async fn is_complete(&self, agents: &[String]) -> bool;

    /// Release any resources held by the backend.
    async fn teardown(&self) {
        self.stop_watching().await;
    }
}

/// Construct a coordination backend by mechanism name.
pub fn create_backend(mechanism: &str) -> Result<Arc<dyn CoordinationBackend>> {
    match mechanism {
        "filesystem" | "filesystem_nudge" => Ok(Arc::new(filesystem::FilesystemNudgeBackend::default())),
        other => {
            anyhow::bail!("unknown coordination mechanism: '{other}'. Available: filesystem, filesystem_nudge")
        }
    }
    .context("constructing coordination backend")
}
