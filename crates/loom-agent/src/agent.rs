use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use loom_protocol::{
    Action, ActionEvent, AgentErrorEvent, AgentStatus, ConversationError, ConversationResult,
    Event, EventKind, EventSource, FINISH_TOOL_NAME, Llm, LlmResponse, NonExecutableActionEvent,
    Observation, ObservationEvent, SystemPromptEvent, ToolCallId,
};
use loom_security::SecurityAnalyzer;
use loom_tools::{Tool, ToolContext, ToolRegistry, is_builtin};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::condenser::Condenser;
use crate::state::ConversationState;
use crate::view::{condensed_view, events_to_messages};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable software agent. Use the available \
tools to complete the user's task, and call `finish` with a short summary when you are done.";

/// Callback invoked once for every event an operation appends.
pub type OnEvent<'a> = &'a (dyn Fn(&Event) + Send + Sync);

/// Serializable description of an agent, persisted in `base_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: String,
    pub system_prompt: String,
    /// Non-builtin tools, by name.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub condenser: Condenser,
    #[serde(default = "default_security_analyzer")]
    pub security_analyzer: String,
}

fn default_security_analyzer() -> String {
    "none".to_owned()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            tools: Vec::new(),
            condenser: Condenser::default(),
            security_analyzer: default_security_analyzer(),
        }
    }
}

/// Decision and execution engine for one conversation.
#[derive(Clone)]
pub struct Agent {
    llm: Arc<dyn Llm>,
    tools: ToolRegistry,
    system_prompt: String,
    security_analyzer: SecurityAnalyzer,
    condenser: Condenser,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.llm.model())
            .field("tools", &self.tools)
            .field("security_analyzer", &self.security_analyzer.name())
            .field("condenser", &self.condenser)
            .finish()
    }
}

impl Agent {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            llm,
            tools: ToolRegistry::with_builtin_tools(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            security_analyzer: SecurityAnalyzer::default(),
            condenser: Condenser::default(),
        }
    }

    /// Rebuild an agent from its persisted description, taking non-builtin
    /// tools from `available`.
    pub fn from_config(
        config: &AgentConfig,
        llm: Arc<dyn Llm>,
        available: &ToolRegistry,
    ) -> ConversationResult<Self> {
        let security_analyzer = SecurityAnalyzer::from_name(&config.security_analyzer)
            .ok_or_else(|| {
                ConversationError::InvalidState(format!(
                    "unknown security analyzer '{}'",
                    config.security_analyzer
                ))
            })?;
        let mut agent = Self::new(llm)
            .with_system_prompt(config.system_prompt.clone())
            .with_security_analyzer(security_analyzer)
            .with_condenser(config.condenser);
        for name in config.tools.iter().filter(|name| !is_builtin(name)) {
            let tool = available.get(name).ok_or_else(|| {
                ConversationError::InvalidState(format!("tool '{name}' is not available"))
            })?;
            agent = agent.with_tool(tool);
        }
        Ok(agent)
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_security_analyzer(mut self, analyzer: SecurityAnalyzer) -> Self {
        self.security_analyzer = analyzer;
        self
    }

    pub fn with_condenser(mut self, condenser: Condenser) -> Self {
        self.condenser = condenser;
        self
    }

    pub fn llm(&self) -> &Arc<dyn Llm> {
        &self.llm
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn security_analyzer(&self) -> &SecurityAnalyzer {
        &self.security_analyzer
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig {
            model: self.llm.model().to_owned(),
            system_prompt: self.system_prompt.clone(),
            tools: self
                .tools
                .names()
                .into_iter()
                .filter(|name| !is_builtin(name))
                .collect(),
            condenser: self.condenser,
            security_analyzer: self.security_analyzer.name().to_owned(),
        }
    }

    fn emit(
        &self,
        state: &mut ConversationState,
        event: &Event,
        on_event: OnEvent<'_>,
    ) -> ConversationResult<()> {
        state.append_event(event)?;
        on_event(event);
        Ok(())
    }

    /// Append the system prompt unless the log already holds anything the
    /// model would see.
    pub fn init_state(
        &self,
        state: &mut ConversationState,
        on_event: OnEvent<'_>,
    ) -> ConversationResult<()> {
        for event in state.events() {
            if event?.kind.is_llm_convertible() {
                debug!(conversation_id = %state.id(), "agent state already initialized");
                return Ok(());
            }
        }
        let event = Event::new(
            EventSource::Agent,
            EventKind::SystemPrompt(SystemPromptEvent {
                system_prompt: self.system_prompt.clone(),
                tools: self.tools.specs(self.security_analyzer.wants_model_risk()),
            }),
        );
        self.emit(state, &event, on_event)?;
        info!(
            conversation_id = %state.id(),
            tools = self.tools.names().len(),
            "agent state initialized"
        );
        Ok(())
    }

    /// One iteration of the decision loop. Always advances the iteration
    /// counter, even when the step fails.
    #[instrument(
        skip_all,
        fields(conversation_id = %state.id(), iteration = state.iteration(), model = self.llm.model())
    )]
    pub async fn step(
        &self,
        state: &mut ConversationState,
        on_event: OnEvent<'_>,
    ) -> ConversationResult<()> {
        let result = self.run_step(state, on_event).await;
        state.advance_iteration();
        result
    }

    async fn run_step(
        &self,
        state: &mut ConversationState,
        on_event: OnEvent<'_>,
    ) -> ConversationResult<()> {
        if state.previous_response_id().is_some() && !self.llm.uses_responses_api() {
            return Err(ConversationError::ResponsesApiMismatch {
                model: self.llm.model().to_owned(),
            });
        }

        let pending = state.unmatched_actions()?;
        if !pending.is_empty() {
            info!(count = pending.len(), "executing confirmed actions");
            return self.execute_actions(state, &pending, on_event).await;
        }

        let events = state.events().to_vec()?;
        let view = condensed_view(&events);
        if let Some(condensation) = self.condenser.condense(&view) {
            let event = Event::new(EventSource::Environment, EventKind::Condensation(condensation));
            return self.emit(state, &event, on_event);
        }

        let messages = events_to_messages(&view);
        let specs = self.tools.specs(self.security_analyzer.wants_model_risk());
        let response = if self.llm.uses_responses_api() {
            let previous = state.previous_response_id().map(|id| id.as_str().to_owned());
            let response = self
                .llm
                .responses(&messages, &specs, previous.as_deref())
                .await?;
            state.set_previous_response_id(Some(response.id.clone()))?;
            response
        } else {
            self.llm.completion(&messages, &specs).await?
        };
        debug!(
            response_id = %response.id,
            tool_calls = response.message.tool_calls.len(),
            "model responded"
        );

        let (proposed, errors) = self.propose(response, logged_call_ids(&events));
        let proposed = self.assign_risk(&events, proposed);
        for event in proposed.iter().chain(errors.iter()) {
            self.emit(state, event, on_event)?;
        }

        let pending: Vec<Event> = proposed
            .into_iter()
            .filter(|event| event.as_action().is_some())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if state.confirmation_policy().requires_confirmation(&pending) {
            info!(count = pending.len(), "actions await user confirmation");
            state.set_agent_status(AgentStatus::WaitingForConfirmation)?;
            return Ok(());
        }
        self.execute_actions(state, &pending, on_event).await
    }

    /// Turn the model's reply into proposed events and validation errors.
    /// A reply without tool calls becomes a finish action. Call ids that are
    /// empty or already taken are replaced so each stays unique in the log.
    fn propose(
        &self,
        response: LlmResponse,
        mut taken: HashSet<String>,
    ) -> (Vec<Event>, Vec<Event>) {
        let LlmResponse { id, message } = response;

        if message.tool_calls.is_empty() {
            let mut action =
                ActionEvent::new(Action::finish(message.content), FINISH_TOOL_NAME, id);
            action.reasoning_content = message.reasoning_content;
            action.thinking_blocks = message.thinking_blocks;
            return (vec![Event::action(action)], Vec::new());
        }

        let mut proposed = Vec::with_capacity(message.tool_calls.len());
        let mut errors = Vec::new();
        for mut call in message.tool_calls {
            if call.id.trim().is_empty() || taken.contains(&call.id) {
                let fresh = ToolCallId::synthesized();
                debug!(reused = %call.id, call_id = %fresh, "reassigned tool call id");
                call.id = fresh.as_str().to_owned();
            }
            taken.insert(call.id.clone());
            match self.tools.validate(&call) {
                Ok(validated) => {
                    let action = ActionEvent {
                        thought: String::new(),
                        reasoning_content: None,
                        thinking_blocks: Vec::new(),
                        action: validated.action,
                        tool_name: validated.tool_name,
                        tool_call_id: ToolCallId::from(call.id.clone()),
                        tool_call: call,
                        llm_response_id: id.clone(),
                        security_risk: validated.reported_risk.unwrap_or_default(),
                    };
                    proposed.push(Event::action(action));
                }
                Err(error) => {
                    warn!(call_id = %call.id, %error, "tool call failed validation");
                    let tool_name = match error.tool_name() {
                        "" => call.name.clone().unwrap_or_default(),
                        name => name.to_owned(),
                    };
                    errors.push(Event::new(
                        EventSource::Agent,
                        EventKind::AgentError(AgentErrorEvent {
                            error: error.to_string(),
                            tool_name,
                            tool_call_id: ToolCallId::from(call.id.clone()),
                        }),
                    ));
                    proposed.push(Event::new(
                        EventSource::Agent,
                        EventKind::NonExecutableAction(NonExecutableActionEvent {
                            thought: String::new(),
                            reasoning_content: None,
                            thinking_blocks: Vec::new(),
                            tool_calls: vec![call],
                            llm_response_id: id.clone(),
                        }),
                    ));
                }
            }
        }

        if let Some(first) = proposed.first_mut() {
            match &mut first.kind {
                EventKind::Action(action) => {
                    action.thought = message.content;
                    action.reasoning_content = message.reasoning_content;
                    action.thinking_blocks = message.thinking_blocks;
                }
                EventKind::NonExecutableAction(action) => {
                    action.thought = message.content;
                    action.reasoning_content = message.reasoning_content;
                    action.thinking_blocks = message.thinking_blocks;
                }
                _ => {}
            }
        }
        (proposed, errors)
    }

    /// Stamp each proposed action with the analyzer's risk before it is
    /// appended; events are immutable afterwards.
    fn assign_risk(&self, context: &[Event], mut proposed: Vec<Event>) -> Vec<Event> {
        let actions: Vec<Event> = proposed
            .iter()
            .filter(|event| event.as_action().is_some())
            .cloned()
            .collect();
        let risks = self
            .security_analyzer
            .analyze_pending_actions(context, &actions);
        for event in &mut proposed {
            if let (Some(risk), EventKind::Action(action)) = (risks.get(&event.id), &mut event.kind)
            {
                action.security_risk = *risk;
            }
        }
        proposed
    }

    async fn execute_actions(
        &self,
        state: &mut ConversationState,
        pending: &[Event],
        on_event: OnEvent<'_>,
    ) -> ConversationResult<()> {
        let context = ToolContext {
            workspace_root: state.workspace_root().to_path_buf(),
            conversation_id: state.id().clone(),
        };
        let mut finished = false;
        for event in pending {
            let Some(action) = event.as_action() else {
                continue;
            };
            let outcome = match self.tools.get(&action.tool_name) {
                Some(tool) => tool
                    .execute(&action.action, &context)
                    .await
                    .map(|observation| render(tool.as_ref(), observation)),
                None => Err(anyhow::anyhow!("tool is no longer registered")),
            };

            let result = match outcome {
                Ok(observation) => {
                    finished |= action.action.is_finish();
                    debug!(
                        tool = %action.tool_name,
                        call_id = %action.tool_call_id,
                        "action executed"
                    );
                    Event::new(
                        EventSource::Environment,
                        EventKind::Observation(ObservationEvent {
                            observation,
                            action_id: event.id.clone(),
                            tool_name: action.tool_name.clone(),
                            tool_call_id: action.tool_call_id.clone(),
                        }),
                    )
                }
                Err(error) => {
                    warn!(
                        tool = %action.tool_name,
                        call_id = %action.tool_call_id,
                        %error,
                        "action failed"
                    );
                    Event::new(
                        EventSource::Agent,
                        EventKind::AgentError(AgentErrorEvent {
                            error: format!("Error executing tool '{}': {error:#}", action.tool_name),
                            tool_name: action.tool_name.clone(),
                            tool_call_id: action.tool_call_id.clone(),
                        }),
                    )
                }
            };
            self.emit(state, &result, on_event)?;
        }

        if finished {
            state.set_agent_status(AgentStatus::Finished)?;
        }
        Ok(())
    }
}

/// Every tool call id already present in the log.
fn logged_call_ids(events: &[Event]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for event in events {
        match &event.kind {
            EventKind::Action(action) => {
                ids.insert(action.tool_call_id.as_str().to_owned());
            }
            EventKind::NonExecutableAction(action) => {
                ids.extend(action.tool_calls.iter().map(|call| call.id.clone()));
            }
            _ => {}
        }
        if let Some(id) = event.resolved_tool_call() {
            ids.insert(id.as_str().to_owned());
        }
    }
    ids
}

/// Apply the tool's own rendering to free-form tool output.
fn render(tool: &dyn Tool, observation: Observation) -> Observation {
    match observation {
        Observation::Tool { is_error, .. } => Observation::Tool {
            content: tool.observation_content(&observation),
            is_error,
        },
        other => other,
    }
}
