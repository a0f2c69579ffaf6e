use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use loom_agent::{Agent, ConversationState, DEFAULT_MAX_ITERATIONS, StuckThresholds};
use loom_protocol::{
    AgentStatus, ConversationError, ConversationId, ConversationResult,
    ConversationStateUpdateEvent, Event, EventKind, EventSource, PauseEvent,
    UserRejectObservation,
};
use loom_security::ConfirmationPolicy;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::Conversation;
use crate::callbacks::{CallbackChain, EventCallback, Visualizer};

/// Builds a [`LocalConversation`], resuming it when the persistence root
/// already holds a conversation with the requested id.
pub struct ConversationBuilder {
    agent: Agent,
    id: Option<ConversationId>,
    workspace_root: PathBuf,
    persistence_root: Option<PathBuf>,
    max_iterations: u32,
    confirmation_policy: ConfirmationPolicy,
    stuck_detection: bool,
    stuck_thresholds: StuckThresholds,
    visualizer: Option<Visualizer>,
    callbacks: Vec<EventCallback>,
}

impl ConversationBuilder {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            id: None,
            workspace_root: PathBuf::from("."),
            persistence_root: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confirmation_policy: ConfirmationPolicy::default(),
            stuck_detection: true,
            stuck_thresholds: StuckThresholds::default(),
            visualizer: None,
            callbacks: Vec::new(),
        }
    }

    pub fn conversation_id(mut self, id: ConversationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Persist under `<root>/<conversation id>/`.
    pub fn persistence_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.persistence_root = Some(root.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn confirmation_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation_policy = policy;
        self
    }

    pub fn stuck_detection(mut self, enabled: bool) -> Self {
        self.stuck_detection = enabled;
        self
    }

    pub fn stuck_thresholds(mut self, thresholds: StuckThresholds) -> Self {
        self.stuck_thresholds = thresholds;
        self
    }

    /// The visualizer always runs before user callbacks.
    pub fn visualizer(mut self, visualizer: Visualizer) -> Self {
        self.visualizer = Some(visualizer);
        self
    }

    /// Print events to stdout.
    pub fn visualize(self, enabled: bool) -> Self {
        if enabled {
            self.visualizer(Visualizer::stdout())
        } else {
            self
        }
    }

    pub fn callback(mut self, callback: EventCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Settings passed to the builder only apply to new conversations; a
    /// resumed one keeps what it persisted.
    pub fn build(self) -> ConversationResult<LocalConversation> {
        let id = self.id.unwrap_or_else(ConversationId::new_uuid);
        let state = match &self.persistence_root {
            Some(root) if ConversationState::exists(root, &id) => {
                info!(conversation_id = %id, "resuming persisted conversation");
                ConversationState::resume(root, &id)?
            }
            root => ConversationState::create(
                id,
                self.agent.config(),
                self.workspace_root,
                root.as_deref(),
            )?
            .with_max_iterations(self.max_iterations)
            .with_confirmation_policy(self.confirmation_policy)
            .with_stuck_detection(self.stuck_detection)
            .with_stuck_thresholds(self.stuck_thresholds),
        };

        let mut callbacks = Vec::with_capacity(self.callbacks.len() + 1);
        if let Some(visualizer) = self.visualizer {
            callbacks.push(visualizer.into_callback());
        }
        callbacks.extend(self.callbacks);

        Ok(LocalConversation {
            id: state.id().clone(),
            agent: self.agent,
            state: AsyncMutex::new(state),
            callbacks: CallbackChain::new(callbacks),
            running: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A conversation driven in-process. The state lock is taken per operation
/// and per loop iteration, so `pause` lands between two steps of a run.
pub struct LocalConversation {
    id: ConversationId,
    agent: Agent,
    state: AsyncMutex<ConversationState>,
    callbacks: CallbackChain,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl LocalConversation {
    pub fn builder(agent: Agent) -> ConversationBuilder {
        ConversationBuilder::new(agent)
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Error message of the most recent failed run, cleared by the next run.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub async fn snapshot(&self) -> Value {
        self.state.lock().await.snapshot()
    }

    /// Snapshot as a full-state update event, the first frame a new
    /// observer receives.
    pub async fn full_state_event(&self) -> Event {
        Event::state_update(ConversationStateUpdateEvent::full_state(
            self.snapshot().await,
        ))
    }

    pub async fn snapshot_map(&self) -> Map<String, Value> {
        match self.snapshot().await {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Start a run on a background task. The running flag is set before
    /// this returns, so a second call fails immediately.
    pub fn spawn_run(self: &Arc<Self>) -> ConversationResult<JoinHandle<ConversationResult<()>>> {
        let guard = self.begin_run()?;
        let conversation = Arc::clone(self);
        Ok(tokio::spawn(async move {
            conversation.run_with(guard).await
        }))
    }

    fn ensure_open(&self) -> ConversationResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConversationError::InvalidState(format!(
                "conversation {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn begin_run(&self) -> ConversationResult<RunGuard> {
        self.ensure_open()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConversationError::InvalidState(format!(
                "conversation {} is already running",
                self.id
            )));
        }
        Ok(RunGuard(Arc::clone(&self.running)))
    }

    fn emit(&self, event: &Event) {
        self.callbacks.dispatch(event);
    }

    fn append(&self, state: &mut ConversationState, event: &Event) -> ConversationResult<()> {
        state.append_event(event)?;
        self.emit(event);
        Ok(())
    }

    fn publish_field(&self, key: &str, value: Value) {
        self.emit(&Event::state_update(ConversationStateUpdateEvent::field(
            key, value,
        )));
    }

    fn set_status(&self, state: &mut ConversationState, status: AgentStatus) -> ConversationResult<()> {
        if state.set_agent_status(status)?.is_some() {
            self.publish_field("agent_status", json!(status));
        }
        Ok(())
    }

    fn publish_status_change(&self, before: AgentStatus, state: &ConversationState) {
        let after = state.agent_status();
        if before != after {
            self.publish_field("agent_status", json!(after));
        }
    }

    #[instrument(skip_all, fields(conversation_id = %self.id))]
    async fn run_with(&self, _guard: RunGuard) -> ConversationResult<()> {
        *self.last_error.lock() = None;
        let result = self.run_loop().await;
        if let Err(error) = &result {
            error!(%error, "conversation run failed");
            *self.last_error.lock() = Some(error.to_string());
        }
        result
    }

    async fn run_loop(&self) -> ConversationResult<()> {
        let emit = |event: &Event| self.emit(event);
        {
            let mut state = self.state.lock().await;
            state.reset_iteration();
            self.agent.init_state(&mut state, &emit)?;
            match state.agent_status() {
                AgentStatus::Finished => {
                    debug!("conversation already finished; nothing to run");
                    return Ok(());
                }
                AgentStatus::WaitingForConfirmation => {
                    info!("pending actions accepted");
                    self.set_status(&mut state, AgentStatus::Running)?;
                }
                _ => self.set_status(&mut state, AgentStatus::Running)?,
            }
        }

        loop {
            let mut state = self.state.lock().await;
            if state.agent_status().halts_run() {
                debug!(status = %state.agent_status(), iterations = state.iteration(), "run stopped");
                return Ok(());
            }
            let max_iterations = state.max_iterations();
            if state.iteration() >= max_iterations {
                self.set_status(&mut state, AgentStatus::Error)?;
                return Err(ConversationError::MaxIterationsReached(max_iterations));
            }

            let before = state.agent_status();
            if let Err(error) = self.agent.step(&mut state, &emit).await {
                self.set_status(&mut state, AgentStatus::Error)?;
                return Err(error);
            }
            self.publish_status_change(before, &state);

            if let Some(pattern) = state.stuck_pattern()? {
                warn!(
                    pattern = pattern.as_str(),
                    iteration = state.iteration(),
                    "agent appears to be stuck in a loop"
                );
            }
        }
    }
}

impl std::fmt::Debug for LocalConversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConversation")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Conversation for LocalConversation {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn add_callback(&self, callback: EventCallback) {
        self.callbacks.push(callback);
    }

    async fn send_message(&self, content: &str) -> ConversationResult<()> {
        self.ensure_open()?;
        let emit = |event: &Event| self.emit(event);
        let mut state = self.state.lock().await;
        self.agent.init_state(&mut state, &emit)?;
        self.append(&mut state, &Event::user_message(content))?;
        if state.agent_status() == AgentStatus::Finished {
            self.set_status(&mut state, AgentStatus::Idle)?;
        }
        state.save()
    }

    async fn run(&self) -> ConversationResult<()> {
        let guard = self.begin_run()?;
        self.run_with(guard).await
    }

    async fn pause(&self) -> ConversationResult<()> {
        let mut state = self.state.lock().await;
        if matches!(
            state.agent_status(),
            AgentStatus::Paused | AgentStatus::Finished
        ) {
            return Ok(());
        }
        self.append(
            &mut state,
            &Event::new(EventSource::User, EventKind::Pause(PauseEvent::default())),
        )?;
        self.set_status(&mut state, AgentStatus::Paused)
    }

    async fn status(&self) -> ConversationResult<AgentStatus> {
        Ok(self.state.lock().await.agent_status())
    }

    async fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> ConversationResult<()> {
        let mut state = self.state.lock().await;
        state.set_confirmation_policy(policy)?;
        self.publish_field("confirmation_policy", json!(policy));
        Ok(())
    }

    #[instrument(skip(self), fields(conversation_id = %self.id))]
    async fn reject_pending_actions(&self, reason: &str) -> ConversationResult<()> {
        let mut state = self.state.lock().await;
        let pending = state.unmatched_actions()?;
        for event in &pending {
            let Some(action) = event.as_action() else {
                continue;
            };
            let rejection = Event::new(
                EventSource::User,
                EventKind::UserReject(UserRejectObservation {
                    rejection_reason: reason.to_owned(),
                    action_id: event.id.clone(),
                    tool_name: action.tool_name.clone(),
                    tool_call_id: action.tool_call_id.clone(),
                }),
            );
            self.append(&mut state, &rejection)?;
        }
        info!(rejected = pending.len(), "pending actions rejected");
        self.set_status(&mut state, AgentStatus::Idle)
    }

    async fn events(&self) -> ConversationResult<Vec<Event>> {
        self.state.lock().await.events().to_vec()
    }

    async fn close(&self) -> ConversationResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.lock().await.save()?;
        info!(conversation_id = %self.id, "conversation closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use loom_agent::{Agent, ScriptedLlm};
    use loom_protocol::{
        AgentStatus, ConversationError, ConversationId, Event, EventKind, LlmResponse,
        ToolCallRequest,
    };
    use loom_security::ConfirmationPolicy;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::LocalConversation;
    use crate::{Conversation, EventCallback, Visualizer};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: EventCallback = Arc::new(move |event: &Event| sink.lock().push(event.clone()));
        (callback, seen)
    }

    fn kinds(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|event| event.kind.name()).collect()
    }

    fn think_call(id: &str, thought: &str) -> ToolCallRequest {
        ToolCallRequest::function(id, "think", &json!({ "thought": thought }))
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn say_hi_finishes_in_one_step() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("Hi!")]));
        let (callback, seen) = recorder();
        let conversation = LocalConversation::builder(Agent::new(llm.clone()))
            .callback(callback)
            .build()?;

        conversation.send_message("Say hi").await?;
        conversation.run().await?;

        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        let events = conversation.events().await?;
        assert_eq!(
            kinds(&events),
            ["SystemPromptEvent", "MessageEvent", "ActionEvent", "ObservationEvent"]
        );
        assert_eq!(llm.calls().len(), 1);

        let statuses: Vec<_> = seen
            .lock()
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::StateUpdate(update) if update.key == "agent_status" => {
                    Some(update.value.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(statuses, [json!("running"), json!("finished")]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_tool_call_is_reported_then_the_run_finishes() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmResponse::tool_calls(
                "",
                vec![ToolCallRequest::function("call-1", "bad_tool", &json!({}))],
            ),
            LlmResponse::text("done"),
        ]));
        let conversation = LocalConversation::builder(Agent::new(llm)).build()?;
        conversation.send_message("go").await?;
        conversation.run().await?;

        let events = conversation.events().await?;
        assert_eq!(
            kinds(&events),
            [
                "SystemPromptEvent",
                "MessageEvent",
                "NonExecutableActionEvent",
                "AgentErrorEvent",
                "ActionEvent",
                "ObservationEvent",
            ]
        );
        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        Ok(())
    }

    #[tokio::test]
    async fn responses_chain_on_a_completion_model_ends_in_error() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("unused")]));
        let root = unique_test_root("loom-mismatch");
        let id = ConversationId::from("conv-mismatch");
        {
            let agent = Agent::new(Arc::new(
                ScriptedLlm::new(vec![LlmResponse::tool_calls(
                    "",
                    vec![think_call("call-1", "plan")],
                )])
                .with_responses_api(true),
            ));
            let conversation = LocalConversation::builder(agent)
                .conversation_id(id.clone())
                .persistence_root(&root)
                .max_iterations(1)
                .build()?;
            conversation.send_message("start").await?;
            let result = conversation.run().await;
            assert!(matches!(result, Err(ConversationError::MaxIterationsReached(1))));
            conversation.close().await?;
        }

        let conversation = LocalConversation::builder(Agent::new(llm.clone()))
            .conversation_id(id)
            .persistence_root(&root)
            .build()?;
        let result = conversation.run().await;
        assert!(matches!(
            result,
            Err(ConversationError::ResponsesApiMismatch { .. })
        ));
        assert_eq!(conversation.status().await?, AgentStatus::Error);
        assert!(conversation.last_error().is_some());
        assert!(llm.calls().is_empty());

        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }

    #[tokio::test]
    async fn max_iterations_stops_a_looping_agent() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(
            (0..5)
                .map(|n| {
                    LlmResponse::tool_calls("", vec![think_call(&format!("call-{n}"), "again")])
                })
                .collect(),
        ));
        let conversation = LocalConversation::builder(Agent::new(llm.clone()))
            .max_iterations(3)
            .stuck_detection(false)
            .build()?;
        conversation.send_message("loop").await?;

        let result = conversation.run().await;
        assert!(matches!(result, Err(ConversationError::MaxIterationsReached(3))));
        assert_eq!(conversation.status().await?, AgentStatus::Error);
        assert_eq!(llm.calls().len(), 3);
        assert!(!conversation.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_can_be_accepted_by_running_again() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmResponse::tool_calls("", vec![think_call("call-1", "ponder")]),
            LlmResponse::text("all done"),
        ]));
        let conversation = LocalConversation::builder(Agent::new(llm))
            .confirmation_policy(ConfirmationPolicy::AlwaysConfirm)
            .build()?;
        conversation.send_message("think first").await?;
        conversation.run().await?;
        assert_eq!(
            conversation.status().await?,
            AgentStatus::WaitingForConfirmation
        );

        conversation.run().await?;
        let events = conversation.events().await?;
        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        assert!(
            events
                .iter()
                .any(|event| matches!(event.kind, EventKind::Observation(_)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejection_resolves_pending_actions_and_idles() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::tool_calls(
            "",
            vec![think_call("call-1", "a"), think_call("call-2", "b")],
        )]));
        let conversation = LocalConversation::builder(Agent::new(llm))
            .confirmation_policy(ConfirmationPolicy::AlwaysConfirm)
            .build()?;
        conversation.set_confirmation_mode(true).await?;
        conversation.send_message("go").await?;
        conversation.run().await?;

        conversation.reject_pending_actions("not now").await?;
        assert_eq!(conversation.status().await?, AgentStatus::Idle);
        let rejections: Vec<_> = conversation
            .events()
            .await?
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::UserReject(rejection) => Some(rejection.rejection_reason),
                _ => None,
            })
            .collect();
        assert_eq!(rejections, ["not now", "not now"]);
        Ok(())
    }

    #[tokio::test]
    async fn visualizer_sees_events_before_user_callbacks() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("Hi!")]));
        let buffer = SharedBuffer::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let printed = buffer.clone();
        let log = Arc::clone(&order);
        let conversation = LocalConversation::builder(Agent::new(llm))
            .callback(Arc::new(move |_: &Event| {
                let lines = String::from_utf8_lossy(&printed.0.lock()).lines().count();
                log.lock().push(lines);
            }))
            .visualizer(Visualizer::new(buffer.clone()))
            .build()?;

        conversation.send_message("hello").await?;
        let text = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
        assert!(text.contains("user: hello"));
        // the callback saw the visualizer's line for its own event
        assert_eq!(order.lock().as_slice(), &[1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn pause_between_runs_is_recorded_and_sending_reopens_finished() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmResponse::text("first"),
            LlmResponse::text("second"),
        ]));
        let conversation = LocalConversation::builder(Agent::new(llm)).build()?;
        conversation.pause().await?;
        assert_eq!(conversation.status().await?, AgentStatus::Paused);
        conversation.send_message("go").await?;
        conversation.run().await?;
        assert_eq!(conversation.status().await?, AgentStatus::Finished);

        conversation.pause().await?;
        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        conversation.send_message("again").await?;
        assert_eq!(conversation.status().await?, AgentStatus::Idle);
        conversation.run().await?;

        let events = conversation.events().await?;
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event.kind, EventKind::Pause(_)))
                .count(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn resumed_conversation_continues_from_disk() -> Result<()> {
        let root = unique_test_root("loom-resume");
        let id = ConversationId::from("conv-resume");
        {
            let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("one")]));
            let conversation = LocalConversation::builder(Agent::new(llm))
                .conversation_id(id.clone())
                .persistence_root(&root)
                .build()?;
            conversation.send_message("first").await?;
            conversation.run().await?;
            conversation.close().await?;
            assert!(conversation.send_message("late").await.is_err());
        }

        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("two")]));
        let conversation = LocalConversation::builder(Agent::new(llm.clone()))
            .conversation_id(id)
            .persistence_root(&root)
            .build()?;
        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        assert_eq!(conversation.events().await?.len(), 4);

        conversation.send_message("second").await?;
        conversation.run().await?;
        let events = conversation.events().await?;
        assert_eq!(events.len(), 7);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event.kind, EventKind::SystemPrompt(_)))
                .count(),
            1
        );
        // the resumed model sees both user turns
        let messages = &llm.calls()[0].messages;
        assert!(messages.iter().any(|message| message.content == "first"));

        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }

    #[tokio::test]
    async fn spawned_runs_are_exclusive() -> Result<()> {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("ok")]));
        let conversation = Arc::new(LocalConversation::builder(Agent::new(llm)).build()?);
        conversation.send_message("go").await?;

        let handle = conversation.spawn_run()?;
        assert!(conversation.is_running());
        assert!(matches!(
            conversation.spawn_run(),
            Err(ConversationError::InvalidState(_))
        ));
        handle.await??;
        assert!(!conversation.is_running());
        assert_eq!(conversation.status().await?, AgentStatus::Finished);
        Ok(())
    }
}
