//! The runtime guard: a rule-matching interceptor that inspects every
//! event emitted by every agent's event stream and, on match, applies one of
//! a fixed set of interventions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::AgentState;
use crate::config::{parse_duration_seconds, OrchestratorAction, OrchestratorRule};
use crate::event::Event;
use crate::session::SessionClient;

/// Notification handed to the controller's escalation callback.
#[derive(Debug, Clone)]
pub struct EscalationNotice {
    pub agent_id: String,
    pub event: Event,
    pub reason: String,
}

/// `(agent_id, event, rule)` escalation callback, invoked out-of-band.
pub type EscalationHandler = Arc<dyn Fn(EscalationNotice) + Send + Sync>;

/// One entry in the intervention log, appended in
/// guard order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub timestamp: DateTime<Utc>,
    pub rule_on: String,
    pub rule_then: OrchestratorAction,
    pub agent_id: String,
    pub action_taken: String,
    pub details: String,
}

/// Rule-matching interceptor. Shared across the event fan-in tasks and the
/// inactivity timers; all mutable state lives behind `DashMap`/`Mutex` so the
/// guard can be handed around as an `Arc`.
pub struct RuntimeGuard {
    rules: Vec<OrchestratorRule>,
    agents: Arc<DashMap<String, AgentState>>,
    session: Arc<SessionClient>,
    hub_id: Option<String>,
    escalation_handler: Option<EscalationHandler>,
    intervention_log: Mutex<Vec<InterventionRecord>>,
    timers: DashMap<String, JoinHandle<()>>,
    stopped: AtomicBool,
}

impl RuntimeGuard {
    pub fn new(
        rules: Vec<OrchestratorRule>,
        agents: Arc<DashMap<String, AgentState>>,
        session: Arc<SessionClient>,
        hub_id: Option<String>,
        escalation_handler: Option<EscalationHandler>,
    ) -> Self {
        Self {
            rules,
            agents,
            session,
            hub_id,
            escalation_handler,
            intervention_log: Mutex::new(Vec::new()),
            timers: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn intervention_log(&self) -> Vec<InterventionRecord> {
        self.intervention_log.lock().await.clone()
    }

    /// Current turn count for an agent (counts assistant `item.completed`s).
    pub fn turn_count(&self, agent_id: &str) -> u32 {
        self.agents.get(agent_id).map(|a| a.turn_count).unwrap_or(0)
    }

    /// Process one event from `agent_id`'s stream: update activity/turns,
    /// match rules, and execute the first match's action. Returns whether a
    /// rule matched, so callers (the controller's bypass fast path) know
    /// whether the guard already resolved a `permission.requested`.
    pub async fn handle_event(self: &Arc<Self>, agent_id: &str, event: &Event) -> bool {
        self.touch_activity(agent_id, event);

        let matched = self.find_matching_rule(agent_id, event);
        let did_match = matched.is_some();
        if let Some(rule) = matched {
            self.apply_action(agent_id, event, &rule).await;
        }

        self.rearm_no_activity_timer(agent_id);
        did_match
    }

    fn touch_activity(&self, agent_id: &str, event: &Event) {
        if let Some(mut state) = self.agents.get_mut(agent_id) {
            state.last_activity = Utc::now();
            if event.is_kind("item.completed") && event.item_role() == Some("assistant") {
                state.turn_count += 1;
            }
        }
    }

    fn agent_role_str(&self, agent_id: &str) -> Option<&'static str> {
        self.agents.get(agent_id).map(|a| a.role.as_str())
    }

    fn from_matches(&self, rule: &OrchestratorRule, agent_id: &str) -> bool {
        let Some(selector) = &rule.from_agent else {
            return true;
        };
        if selector == agent_id {
            return true;
        }
        match selector.as_str() {
            "coordinator" | "hub" => self.agent_role_str(agent_id) == Some("hub"),
            "worker" => self.agent_role_str(agent_id) == Some("worker"),
            "peer" => matches!(self.agent_role_str(agent_id), Some("peer") | None),
            _ => false,
        }
    }

    fn find_matching_rule(&self, agent_id: &str, event: &Event) -> Option<OrchestratorRule> {
        self.rules.iter().find_map(|rule| {
            if rule.on != event.kind {
                return None;
            }
            if !self.from_matches(rule, agent_id) {
                return None;
            }
            if let Some(condition) = &rule.if_condition {
                if !condition_matches(condition, event) {
                    return None;
                }
            }
            Some(rule.clone())
        })
    }

    async fn apply_action(&self, agent_id: &str, event: &Event, rule: &OrchestratorRule) {
        let (action_taken, details) = match rule.then {
            OrchestratorAction::Approve => {
                self.reply_permission(agent_id, event, "once").await;
                ("approve".to_string(), event.action().to_string())
            }
            OrchestratorAction::Reject => {
                self.reply_permission(agent_id, event, "deny").await;
                ("reject".to_string(), event.action().to_string())
            }
            OrchestratorAction::Escalate | OrchestratorAction::EscalateToHuman => {
                let reason = rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("rule on {} matched", rule.on));
                warn!(agent_id, reason = %reason, "escalating to human operator");
                if let Some(handler) = &self.escalation_handler {
                    handler(EscalationNotice {
                        agent_id: agent_id.to_string(),
                        event: event.clone(),
                        reason: reason.clone(),
                    });
                }
                ("escalate".to_string(), reason)
            }
            OrchestratorAction::Log => ("log".to_string(), event.action().to_string()),
            OrchestratorAction::Nudge => {
                let message = rule.message.clone().unwrap_or_default();
                self.post_to_agent(agent_id, &message).await;
                ("nudge".to_string(), message)
            }
            OrchestratorAction::NudgeCoordinator => {
                let message = rule.message.clone().unwrap_or_default();
                let target = self.hub_id.clone().unwrap_or_else(|| agent_id.to_string());
                self.post_to_agent(&target, &message).await;
                ("nudge_coordinator".to_string(), message)
            }
        };

        let mut log = self.intervention_log.lock().await;
        log.push(InterventionRecord {
            timestamp: Utc::now(),
            rule_on: rule.on.clone(),
            rule_then: rule.then,
            agent_id: agent_id.to_string(),
            action_taken,
            details,
        });
    }

    async fn reply_permission(&self, agent_id: &str, event: &Event, reply: &str) {
        let Some(permission_id) = event.permission_id() else {
            warn!(agent_id, "rule matched a permission action with no permission_id");
            return;
        };
        let Some(session_id) = self.session_id_for(agent_id) else {
            return;
        };
        if let Err(e) = self
            .session
            .reply_permission(&session_id, permission_id, reply)
            .await
        {
            warn!(agent_id, error = %e, "failed to reply to permission request");
        }
    }

    async fn post_to_agent(&self, agent_id: &str, message: &str) {
        let Some(session_id) = self.session_id_for(agent_id) else {
            return;
        };
        if let Err(e) = self.session.post_message(&session_id, message).await {
            warn!(agent_id, error = %e, "failed to post guard nudge");
        }
    }

    fn session_id_for(&self, agent_id: &str) -> Option<String> {
        self.agents.get(agent_id).map(|a| a.session_id.clone())
    }

    /// Cancel any pending timer and arm a fresh one, if a `no_activity` rule
    /// applies to this agent. Only the first matching rule in rule order is
    /// armed per reset, mirroring ordinary matching precedence.
    fn rearm_no_activity_timer(self: &Arc<Self>, agent_id: &str) {
        if let Some((_, handle)) = self.timers.remove(agent_id) {
            handle.abort();
        }

        let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.on == "no_activity" && self.from_matches(r, agent_id))
            .cloned()
        else {
            return;
        };
        let Some(after) = &rule.after else {
            return;
        };
        let Ok(secs) = parse_duration_seconds(after) else {
            warn!(agent_id, after = %after, "invalid no_activity duration");
            return;
        };

        let guard = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let still_idle = guard
                .agents
                .get(&agent_id)
                .map(|a| {
                    Utc::now().signed_duration_since(a.last_activity).num_seconds() as u64 >= secs
                })
                .unwrap_or(false);
            if !still_idle || guard.stopped.load(Ordering::SeqCst) {
                return;
            }
            debug!(agent_id, "no-activity timer fired");
            guard.apply_action(&agent_id, &Event::no_activity(), &rule).await;
        });
        self.timers.insert(agent_id.to_string(), handle);
    }

    /// Cancel all pending timers. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
    }
}

/// Parse and evaluate the minimal condition grammar: one or more
/// `action contains "<substr>"` clauses joined by (case-insensitive) `or`.
/// Unknown syntax never matches.
pub fn condition_matches(condition: &str, event: &Event) -> bool {
    let action = event.action().to_lowercase();
    condition
        .split(" or ")
        .map(str::trim)
        .any(|clause| match parse_contains_clause(clause) {
            Some(substr) => action.contains(&substr.to_lowercase()),
            None => false,
        })
}

fn parse_contains_clause(clause: &str) -> Option<&str> {
    let rest = clause.strip_prefix("action")?.trim_start();
    let rest = rest.strip_prefix("contains")?.trim_start();
    let rest = rest.strip_prefix('"')?;
    rest.strip_suffix('"')
}

/// Mapping helper used when the controller constructs rule-matching
/// from-agent metadata for agents it has not yet registered (used by tests
/// that exercise matching in isolation).
pub fn role_matches_selector(role: &str, selector: &str) -> bool {
    match selector {
        "coordinator" | "hub" => role == "hub",
        "worker" => role == "worker",
        "peer" => role == "peer",
        other => other == role,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contains_clause_matches_case_insensitively() {
        let event = Event::new(
            "permission.requested",
            json!({"action": "curl https://example.com"}),
        );
        assert!(condition_matches(r#"action contains "CURL""#, &event));
        assert!(condition_matches(
            r#"action contains "wget" or action contains "curl""#,
            &event
        ));
        assert!(!condition_matches(r#"action contains "scp""#, &event));
    }

    #[test]
    fn unknown_syntax_never_matches() {
        let event = Event::new("permission.requested", json!({"action": "rm -rf /"}));
        assert!(!condition_matches("action == \"rm -rf\"", &event));
        assert!(!condition_matches("garbage", &event));
    }

    #[test]
    fn role_selector_matching() {
        assert!(role_matches_selector("hub", "coordinator"));
        assert!(role_matches_selector("hub", "hub"));
        assert!(role_matches_selector("worker", "worker"));
        assert!(!role_matches_selector("worker", "hub"));
        assert!(role_matches_selector("agent-7", "agent-7"));
    }
}
