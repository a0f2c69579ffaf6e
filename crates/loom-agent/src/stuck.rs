use loom_protocol::{Event, EventKind, EventSource, MessageRole};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckThresholds {
    pub action_observation: usize,
    pub action_error: usize,
    pub monologue: usize,
    pub alternating_pattern: usize,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        Self {
            action_observation: 4,
            action_error: 3,
            monologue: 3,
            alternating_pattern: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckPattern {
    RepeatedActionObservation,
    RepeatedActionError,
    Monologue,
    AlternatingPattern,
}

impl StuckPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepeatedActionObservation => "repeated_action_observation",
            Self::RepeatedActionError => "repeated_action_error",
            Self::Monologue => "monologue",
            Self::AlternatingPattern => "alternating_pattern",
        }
    }
}

/// Outcome of an action, fingerprinted so equal outcomes compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Observation(String),
    Error(String),
}

fn fingerprint(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    hex::encode(digest)
}

fn all_equal<T: PartialEq>(items: &[T]) -> bool {
    items.windows(2).all(|pair| pair[0] == pair[1])
}

/// Flags repetitive loops in the recent event history. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckDetector {
    pub thresholds: StuckThresholds,
}

impl StuckDetector {
    pub fn new(thresholds: StuckThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_stuck(&self, events: &[Event]) -> bool {
        self.detect(events).is_some()
    }

    /// First matching loop pattern among the events since the last user
    /// message.
    pub fn detect(&self, events: &[Event]) -> Option<StuckPattern> {
        let start = events
            .iter()
            .rposition(|event| {
                event.source == EventSource::User && matches!(event.kind, EventKind::Message(_))
            })
            .map_or(0, |index| index + 1);
        let recent = &events[start..];

        let mut actions = Vec::new();
        let mut outcomes = Vec::new();
        for event in recent {
            match &event.kind {
                EventKind::Action(action) => actions.push(fingerprint(&json!({
                    "tool": action.tool_name,
                    "arguments": action.action.to_arguments(),
                }))),
                EventKind::Observation(observation) => outcomes.push(Outcome::Observation(
                    fingerprint(&json!(observation.observation.to_llm_content())),
                )),
                EventKind::AgentError(error) => {
                    outcomes.push(Outcome::Error(fingerprint(&json!(error.error))));
                }
                _ => {}
            }
        }

        if self.repeated_action_observation(&actions, &outcomes) {
            Some(StuckPattern::RepeatedActionObservation)
        } else if self.repeated_action_error(&actions, &outcomes) {
            Some(StuckPattern::RepeatedActionError)
        } else if self.monologue(recent) {
            Some(StuckPattern::Monologue)
        } else if self.alternating(&actions, &outcomes) {
            Some(StuckPattern::AlternatingPattern)
        } else {
            None
        }
    }

    fn repeated_action_observation(&self, actions: &[String], outcomes: &[Outcome]) -> bool {
        let n = self.thresholds.action_observation;
        if n == 0 || actions.len() < n || outcomes.len() < n {
            return false;
        }
        let last_outcomes = &outcomes[outcomes.len() - n..];
        all_equal(&actions[actions.len() - n..])
            && last_outcomes
                .iter()
                .all(|outcome| matches!(outcome, Outcome::Observation(_)))
            && all_equal(last_outcomes)
    }

    fn repeated_action_error(&self, actions: &[String], outcomes: &[Outcome]) -> bool {
        let n = self.thresholds.action_error;
        if n == 0 || actions.len() < n || outcomes.len() < n {
            return false;
        }
        all_equal(&actions[actions.len() - n..])
            && outcomes[outcomes.len() - n..]
                .iter()
                .all(|outcome| matches!(outcome, Outcome::Error(_)))
    }

    fn monologue(&self, recent: &[Event]) -> bool {
        let n = self.thresholds.monologue;
        if n == 0 {
            return false;
        }
        let mut contents = Vec::new();
        for event in recent.iter().rev() {
            match &event.kind {
                EventKind::Message(message)
                    if event.source == EventSource::Agent
                        && message.llm_message.role == MessageRole::Assistant =>
                {
                    contents.push(message.llm_message.content.as_str());
                }
                EventKind::StateUpdate(_) | EventKind::Condensation(_) => {}
                _ => break,
            }
        }
        contents.len() >= n && all_equal(&contents[..n])
    }

    fn alternating(&self, actions: &[String], outcomes: &[Outcome]) -> bool {
        let n = self.thresholds.alternating_pattern;
        if n < 4 || actions.len() < n || outcomes.len() < n {
            return false;
        }
        let actions = &actions[actions.len() - n..];
        let outcomes = &outcomes[outcomes.len() - n..];
        let alternates = |window: &[String]| window.windows(3).all(|w| w[0] == w[2]);
        let outcome_alternates = outcomes.windows(3).all(|w| w[0] == w[2]);
        alternates(actions) && actions[0] != actions[1] && outcome_alternates
    }
}
