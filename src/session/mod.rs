//! Thin client for the remote agent-session daemon.
//!
//! The daemon is a separate process speaking HTTP + SSE at
//! `http://<host>:<port>/v1`. This module owns spawning it, waiting for its
//! health check, and wrapping the handful of endpoints the rest of the
//! runtime needs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::HelmError;
use crate::event::Event;

const API_PREFIX: &str = "/v1";

/// Configuration for launching and reaching the daemon.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub binary_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("sandbox-agent"),
            host: "127.0.0.1".to_string(),
            port: 8765,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for creating a single session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "agent")]
    pub agent: String,
    #[serde(rename = "permissionMode")]
    pub permission_mode: String,
    #[serde(rename = "allowedCommands", skip_serializing_if = "Option::is_none")]
    pub allowed_commands: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent: "claude".to_string(),
            permission_mode: "default".to_string(),
            allowed_commands: None,
            cwd: None,
        }
    }
}

/// Client + owned subprocess for the agent-session daemon.
///
/// `process` lives behind its own async mutex (rather than requiring `&mut
/// self`) so a single `Arc<SessionClient>` can be shared across the guard,
/// the coordination backend, and every per-agent stream task.
pub struct SessionClient {
    config: SdkConfig,
    http: reqwest::Client,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl SessionClient {
    pub fn new(config: SdkConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            config,
            http,
            process: tokio::sync::Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url(), API_PREFIX, path)
    }

    /// Spawn the daemon subprocess and wait for `/health` to respond.
    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }

        let child = Command::new(&self.config.binary_path)
            .arg("server")
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--no-token")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HelmError::SessionDaemonUnavailable(e.to_string()))
            .context("spawning agent-session daemon")?;
        *process = Some(child);
        drop(process);

        self.wait_for_health().await
    }

    async fn wait_for_health(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if let Ok(resp) = self.http.get(self.api_url("/health")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HelmError::SessionDaemonUnavailable(
                    "daemon did not become healthy within 15s".to_string(),
                )
                .into());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn create_session(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(&format!("/sessions/{session_id}")))
            .json(config)
            .send()
            .await
            .with_context(|| format!("creating session {session_id}"))?;
        resp.error_for_status()
            .with_context(|| format!("daemon rejected session creation for {session_id}"))?;
        Ok(())
    }

    pub async fn terminate_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(&format!("/sessions/{session_id}/terminate")))
            .send()
            .await;
        // A session may already be gone; swallow HTTP errors here since
        // teardown is always best-effort.
        if let Ok(r) = resp {
            let _ = r.error_for_status();
        }
        Ok(())
    }

    pub async fn post_message(&self, session_id: &str, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(&format!("/sessions/{session_id}/messages")))
            .json(&json!({ "message": message }))
            .send()
            .await
            .with_context(|| format!("posting message to session {session_id}"))?;
        resp.error_for_status()
            .with_context(|| format!("daemon rejected message for {session_id}"))?;
        Ok(())
    }

    pub async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(&format!(
                "/sessions/{session_id}/permissions/{permission_id}/reply"
            )))
            .json(&json!({ "reply": reply }))
            .send()
            .await
            .with_context(|| format!("replying to permission {permission_id}"))?;
        resp.error_for_status()
            .with_context(|| format!("daemon rejected permission reply for {permission_id}"))?;
        Ok(())
    }

    pub async fn reply_question(
        &self,
        session_id: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(&format!(
                "/sessions/{session_id}/questions/{question_id}/reply"
            )))
            .json(&json!({ "answer": answer }))
            .send()
            .await
            .with_context(|| format!("replying to question {question_id}"))?;
        resp.error_for_status()
            .with_context(|| format!("daemon rejected question reply for {question_id}"))?;
        Ok(())
    }

    /// Open an SSE event stream for a session.
    pub fn open_event_stream(&self, session_id: &str) -> Result<EventStream> {
        let url = self.api_url(&format!("/sessions/{session_id}/events/sse"));
        let request = self.http.get(url);
        let source = EventSource::new(request).context("opening SSE event stream")?;
        Ok(EventStream { inner: source })
    }

    /// Stop the daemon and release the HTTP client.
    pub async fn dispose(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            if let Some(id) = child.id() {
                debug!(pid = id, "terminating agent-session daemon");
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// A single agent's SSE event stream, yielding parsed [`Event`]s.
///
/// A read timeout (no bytes for the life of the connection) surfaces as a
/// normal end-of-stream rather than an error, matching the daemon contract's
/// treatment of idle connections.
pub struct EventStream {
    inner: EventSource,
}

impl EventStream {
    /// Read the next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.inner.next().await {
                None => return None,
                Some(Ok(SseEvent::Open)) => continue,
                Some(Ok(SseEvent::Message(message))) => {
                    if message.event != "message" || message.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&message.data) {
                        Ok(value) => {
                            let kind = value
                                .get("type")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown")
                                .to_string();
                            let data = value.get("data").cloned().unwrap_or(serde_json::json!({}));
                            let event = Event::new(kind, data);
                            if event.is_kind("session.ended") {
                                self.inner.close();
                            }
                            return Some(event);
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping malformed SSE frame");
                            continue;
                        }
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => return None,
                Some(Err(e)) => {
                    warn!(error = %e, "event stream ended with a transport error");
                    return None;
                }
            }
        }
    }
}

/// Health-check a running daemon without spawning one (used by `status`/CLI).
pub async fn health_check(host: &str, port: u16) -> bool {
    let client = reqwest::Client::new();
    client
        .get(format!("http://{host}:{port}{API_PREFIX}/health"))
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}
