use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loom_events::{EventLog, FileRecordStore};
use loom_protocol::{
    AgentStatus, ConversationError, ConversationId, ConversationResult, Event, EventKind,
    ResponseId,
};
use loom_security::ConfirmationPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::agent::AgentConfig;
use crate::stuck::{StuckDetector, StuckPattern, StuckThresholds};

pub const BASE_STATE_FILE: &str = "base_state.json";
pub const EVENTS_DIR: &str = "events";
pub const DEFAULT_MAX_ITERATIONS: u32 = 500;

/// Conversation-level metadata persisted next to the event records.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaseState {
    id: ConversationId,
    agent_status: AgentStatus,
    confirmation_policy: ConfirmationPolicy,
    max_iterations: u32,
    stuck_detection: bool,
    #[serde(default)]
    stuck_thresholds: StuckThresholds,
    #[serde(default)]
    previous_response_id: Option<ResponseId>,
    #[serde(default)]
    activated_knowledge_microagents: Vec<String>,
    workspace_root: PathBuf,
    agent_config: AgentConfig,
}

/// The mutable aggregate of one conversation.
///
/// Owners wrap it in a mutex; every status transition and log append happens
/// while that lock is held.
#[derive(Debug)]
pub struct ConversationState {
    id: ConversationId,
    events: EventLog,
    agent_status: AgentStatus,
    confirmation_policy: ConfirmationPolicy,
    max_iterations: u32,
    iteration: u32,
    stuck_detection: bool,
    stuck_detector: StuckDetector,
    previous_response_id: Option<ResponseId>,
    activated_knowledge_microagents: Vec<String>,
    workspace_root: PathBuf,
    agent_config: AgentConfig,
    persistence_dir: Option<PathBuf>,
}

impl ConversationState {
    /// Fresh state. Nothing is written until the first mutation or
    /// [`ConversationState::save`].
    #[instrument(skip(agent_config, workspace_root, persistence_root), fields(conversation_id = %id))]
    pub fn create(
        id: ConversationId,
        agent_config: AgentConfig,
        workspace_root: impl Into<PathBuf>,
        persistence_root: Option<&Path>,
    ) -> ConversationResult<Self> {
        let persistence_dir = persistence_root.map(|root| root.join(id.as_str()));
        let events = match &persistence_dir {
            Some(dir) => EventLog::open(Arc::new(FileRecordStore::new(dir.join(EVENTS_DIR))))?,
            None => EventLog::in_memory(),
        };
        debug!(persisted = persistence_dir.is_some(), "conversation state created");
        Ok(Self {
            id,
            events,
            agent_status: AgentStatus::Idle,
            confirmation_policy: ConfirmationPolicy::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            iteration: 0,
            stuck_detection: true,
            stuck_detector: StuckDetector::default(),
            previous_response_id: None,
            activated_knowledge_microagents: Vec::new(),
            workspace_root: workspace_root.into(),
            agent_config,
            persistence_dir,
        })
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_confirmation_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation_policy = policy;
        self
    }

    pub fn with_stuck_detection(mut self, enabled: bool) -> Self {
        self.stuck_detection = enabled;
        self
    }

    pub fn with_stuck_thresholds(mut self, thresholds: StuckThresholds) -> Self {
        self.stuck_detector = StuckDetector::new(thresholds);
        self
    }

    /// Whether `root` holds a persisted conversation with this id.
    pub fn exists(root: &Path, id: &ConversationId) -> bool {
        root.join(id.as_str()).join(BASE_STATE_FILE).is_file()
    }

    /// Reload a persisted conversation: `base_state.json` plus its event log.
    /// A conversation persisted mid-run comes back idle.
    #[instrument(skip(root), fields(conversation_id = %id))]
    pub fn resume(root: &Path, id: &ConversationId) -> ConversationResult<Self> {
        let dir = root.join(id.as_str());
        let path = dir.join(BASE_STATE_FILE);
        let raw = fs::read_to_string(&path).map_err(|error| {
            ConversationError::Io(format!("failed reading {}: {error}", path.display()))
        })?;
        let base: BaseState = serde_json::from_str(&raw)?;
        if base.id != *id {
            return Err(ConversationError::InvalidState(format!(
                "{} belongs to conversation {}, not {id}",
                path.display(),
                base.id
            )));
        }
        let events = EventLog::open(Arc::new(FileRecordStore::new(dir.join(EVENTS_DIR))))?;

        let agent_status = match base.agent_status {
            AgentStatus::Running => AgentStatus::Idle,
            other => other,
        };
        info!(events = events.len(), status = %agent_status, "conversation resumed");
        Ok(Self {
            id: base.id,
            events,
            agent_status,
            confirmation_policy: base.confirmation_policy,
            max_iterations: base.max_iterations,
            iteration: 0,
            stuck_detection: base.stuck_detection,
            stuck_detector: StuckDetector::new(base.stuck_thresholds),
            previous_response_id: base.previous_response_id,
            activated_knowledge_microagents: base.activated_knowledge_microagents,
            workspace_root: base.workspace_root,
            agent_config: base.agent_config,
            persistence_dir: Some(dir),
        })
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn agent_status(&self) -> AgentStatus {
        self.agent_status
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        self.confirmation_policy
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn stuck_detection(&self) -> bool {
        self.stuck_detection
    }

    pub fn previous_response_id(&self) -> Option<&ResponseId> {
        self.previous_response_id.as_ref()
    }

    pub fn activated_knowledge_microagents(&self) -> &[String] {
        &self.activated_knowledge_microagents
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn agent_config(&self) -> &AgentConfig {
        &self.agent_config
    }

    pub fn persistence_dir(&self) -> Option<&Path> {
        self.persistence_dir.as_deref()
    }

    /// Append to the log. Transient state updates are never persisted.
    pub fn append_event(&mut self, event: &Event) -> ConversationResult<usize> {
        if matches!(event.kind, EventKind::StateUpdate(_)) {
            return Err(ConversationError::InvalidState(
                "state update events are not appended to the log".to_owned(),
            ));
        }
        self.events.append(event)
    }

    /// Returns the previous status when it changed.
    pub fn set_agent_status(&mut self, status: AgentStatus) -> ConversationResult<Option<AgentStatus>> {
        if self.agent_status == status {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut self.agent_status, status);
        info!(conversation_id = %self.id, from = %previous, to = %status, "agent status changed");
        self.save()?;
        Ok(Some(previous))
    }

    pub fn set_confirmation_policy(&mut self, policy: ConfirmationPolicy) -> ConversationResult<()> {
        self.confirmation_policy = policy;
        self.save()
    }

    pub fn set_max_iterations(&mut self, max_iterations: u32) -> ConversationResult<()> {
        self.max_iterations = max_iterations;
        self.save()
    }

    pub fn set_stuck_detection(&mut self, enabled: bool) -> ConversationResult<()> {
        self.stuck_detection = enabled;
        self.save()
    }

    pub fn set_stuck_thresholds(&mut self, thresholds: StuckThresholds) -> ConversationResult<()> {
        self.stuck_detector = StuckDetector::new(thresholds);
        self.save()
    }

    pub fn set_previous_response_id(&mut self, id: Option<ResponseId>) -> ConversationResult<()> {
        if self.previous_response_id == id {
            return Ok(());
        }
        self.previous_response_id = id;
        self.save()
    }

    pub fn activate_knowledge_microagent(&mut self, name: impl Into<String>) -> ConversationResult<()> {
        let name = name.into();
        if self.activated_knowledge_microagents.contains(&name) {
            return Ok(());
        }
        self.activated_knowledge_microagents.push(name);
        self.save()
    }

    pub fn advance_iteration(&mut self) -> u32 {
        self.iteration = self.iteration.saturating_add(1);
        self.iteration
    }

    pub fn reset_iteration(&mut self) {
        self.iteration = 0;
    }

    /// Action events with no observation, rejection or error yet, in log
    /// order. Observations and rejections point at the action event itself.
    pub fn unmatched_actions(&self) -> ConversationResult<Vec<Event>> {
        let events = self.events.to_vec()?;
        let mut answered = HashSet::new();
        let mut failed = HashSet::new();
        for event in &events {
            match &event.kind {
                EventKind::Observation(observation) => {
                    answered.insert(&observation.action_id);
                }
                EventKind::UserReject(rejection) => {
                    answered.insert(&rejection.action_id);
                }
                EventKind::AgentError(error) => {
                    failed.insert(&error.tool_call_id);
                }
                _ => {}
            }
        }
        Ok(events
            .iter()
            .filter(|event| {
                event.as_action().is_some_and(|action| {
                    !answered.contains(&event.id) && !failed.contains(&action.tool_call_id)
                })
            })
            .cloned()
            .collect())
    }

    /// Advisory loop check over the log; always `None` when detection is off.
    pub fn stuck_pattern(&self) -> ConversationResult<Option<StuckPattern>> {
        if !self.stuck_detection {
            return Ok(None);
        }
        Ok(self.stuck_detector.detect(&self.events.to_vec()?))
    }

    pub fn is_stuck(&self) -> ConversationResult<bool> {
        Ok(self.stuck_pattern()?.is_some())
    }

    /// Conversation-level fields as pushed in a `full_state` update.
    pub fn snapshot(&self) -> Value {
        json!({
            "id": self.id,
            "agent_status": self.agent_status,
            "confirmation_policy": self.confirmation_policy,
            "max_iterations": self.max_iterations,
            "iteration": self.iteration,
            "stuck_detection": self.stuck_detection,
            "previous_response_id": self.previous_response_id,
            "activated_knowledge_microagents": self.activated_knowledge_microagents,
            "workspace_root": self.workspace_root,
            "agent_config": self.agent_config,
            "event_count": self.events.len(),
        })
    }

    /// Write `base_state.json`. A no-op for in-memory conversations.
    pub fn save(&self) -> ConversationResult<()> {
        let Some(dir) = &self.persistence_dir else {
            return Ok(());
        };
        let base = BaseState {
            id: self.id.clone(),
            agent_status: self.agent_status,
            confirmation_policy: self.confirmation_policy,
            max_iterations: self.max_iterations,
            stuck_detection: self.stuck_detection,
            stuck_thresholds: self.stuck_detector.thresholds,
            previous_response_id: self.previous_response_id.clone(),
            activated_knowledge_microagents: self.activated_knowledge_microagents.clone(),
            workspace_root: self.workspace_root.clone(),
            agent_config: self.agent_config.clone(),
        };
        write_pretty_json(&dir.join(BASE_STATE_FILE), &base)?;
        debug!(conversation_id = %self.id, "base state saved");
        Ok(())
    }
}

fn write_pretty_json<T: Serialize>(path: &Path, value: &T) -> ConversationResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(value)?;
    fs::write(path, payload)?;
    Ok(())
}
