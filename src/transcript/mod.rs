//! Event collector and transcript assembly.
//!
//! Aggregates per-agent event streams and the flat coordination-message list
//! into a single structured transcript, emitted as JSON and a human-readable
//! Markdown rendering.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::coordination::{CoordinationMessage, MessageType};
use crate::event::Event;

/// A single event, stamped with receipt time and owning agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Totals derived from the coordination message list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationSummary {
    pub total: usize,
    pub delivered: usize,
    pub delivery_rate: Option<f64>,
    pub by_type: HashMap<String, usize>,
}

impl CoordinationSummary {
    pub fn compute(messages: &[CoordinationMessage]) -> Self {
        let total = messages.len();
        let delivered = messages.iter().filter(|m| m.delivered).count();
        let delivery_rate = if total == 0 {
            None
        } else {
            Some(delivered as f64 / total as f64)
        };
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for m in messages {
            *by_type.entry(message_type_key(m.message_type).to_string()).or_insert(0) += 1;
        }
        Self {
            total,
            delivered,
            delivery_rate,
            by_type,
        }
    }
}

fn message_type_key(t: MessageType) -> &'static str {
    match t {
        MessageType::TaskAssignment => "task_assignment",
        MessageType::StatusUpdate => "status_update",
        MessageType::CompletionSignal => "completion_signal",
        MessageType::Question => "question",
        MessageType::Decision => "decision",
        MessageType::PeerMessage => "peer_message",
        MessageType::Nudge => "nudge",
    }
}

/// The full per-experiment transcript (serialized to `transcripts/full.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub agents: HashMap<String, Vec<RecordedEvent>>,
    pub coordination_messages: Vec<CoordinationMessage>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub coordination_summary: CoordinationSummary,
}

impl Transcript {
    /// Render a human-readable Markdown summary (`transcripts/full.md`).
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Experiment Transcript\n\n");
        out.push_str(&format!("- start: {}\n", self.start_time.to_rfc3339()));
        if let Some(end) = self.end_time {
            out.push_str(&format!("- end: {}\n", end.to_rfc3339()));
        }
        out.push_str(&format!(
            "- coordination messages: {} (delivered {}, rate {})\n\n",
            self.coordination_summary.total,
            self.coordination_summary.delivered,
            self.coordination_summary
                .delivery_rate
                .map(|r| format!("{r:.2}"))
                .unwrap_or_else(|| "n/a".to_string())
        ));

        let mut agent_ids: Vec<&String> = self.agents.keys().collect();
        agent_ids.sort();
        for agent_id in agent_ids {
            out.push_str(&format!("## Agent: {agent_id}\n\n"));
            for recorded in &self.agents[agent_id] {
                out.push_str(&format!(
                    "- [{}] {}\n",
                    recorded.timestamp.to_rfc3339(),
                    recorded.event.kind
                ));
            }
            out.push('\n');
        }

        out.push_str("## Coordination Messages\n\n");
        for message in &self.coordination_messages {
            out.push_str(&format!(
                "- [{}] {:?} {} -> {}{}\n",
                message.timestamp.to_rfc3339(),
                message.message_type,
                message.sender.as_deref().unwrap_or("-"),
                message.recipient.as_deref().unwrap_or("-"),
                if message.delivered { " (delivered)" } else { "" }
            ));
        }
        out
    }
}

/// Collects events and coordination messages as a run proceeds.
pub struct Collector {
    per_agent: DashMap<String, Vec<RecordedEvent>>,
    messages: Mutex<Vec<CoordinationMessage>>,
    start_time: DateTime<Utc>,
    end_time: Mutex<Option<DateTime<Utc>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            per_agent: DashMap::new(),
            messages: Mutex::new(Vec::new()),
            start_time: Utc::now(),
            end_time: Mutex::new(None),
        }
    }

    /// Record one event from `agent_id`'s stream (must belong to a
    /// registered session).
    pub fn record(&self, agent_id: &str, event: Event) {
        self.per_agent
            .entry(agent_id.to_string())
            .or_default()
            .push(RecordedEvent {
                timestamp: Utc::now(),
                event,
            });
    }

    /// Append a coordination message. The message list is append-only.
    pub async fn record_message(&self, message: CoordinationMessage) {
        self.messages.lock().await.push(message);
    }

    pub async fn finish(&self) {
        let mut end = self.end_time.lock().await;
        if end.is_none() {
            *end = Some(Utc::now());
        }
    }

    pub async fn to_transcript(&self) -> Transcript {
        let agents = self
            .per_agent
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let messages = self.messages.lock().await.clone();
        let coordination_summary = CoordinationSummary::compute(&messages);
        Transcript {
            agents,
            coordination_messages: messages,
            start_time: self.start_time,
            end_time: *self.end_time.lock().await,
            coordination_summary,
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_events_per_agent_and_renders_markdown() {
        let collector = Collector::new();
        collector.record("alice", Event::new("session.started", json!({})));
        collector.record(
            "alice",
            Event::new("item.completed", json!({"item": {"role": "assistant"}})),
        );
        collector
            .record_message(CoordinationMessage::new(
                Some("alice".to_string()),
                Some("bob".to_string()),
                MessageType::PeerMessage,
                "hello".to_string(),
                Some("messages/001-alice-bob.md".to_string()),
            ))
            .await;
        collector.finish().await;

        let transcript = collector.to_transcript().await;
        assert_eq!(transcript.agents["alice"].len(), 2);
        assert_eq!(transcript.coordination_summary.total, 1);
        assert_eq!(transcript.coordination_summary.delivered, 0);
        assert_eq!(transcript.coordination_summary.delivery_rate, Some(0.0));
        assert!(transcript.end_time.is_some());

        let rendered = transcript.render_markdown();
        assert!(rendered.contains("Agent: alice"));
        assert!(rendered.contains("Coordination Messages"));
    }

    #[test]
    fn empty_summary_reports_null_delivery_rate() {
        let summary = CoordinationSummary::compute(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.delivery_rate, None);
    }
}
