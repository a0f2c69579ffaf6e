//! The model's view of a conversation: condensation-aware event filtering and
//! conversion to chat messages.

use std::collections::HashSet;

use loom_protocol::{
    CondensationSummaryEvent, Event, EventId, EventKind, EventSource, LlmMessage, MessageRole,
    ResponseId, ToolCallRequest,
};

/// Id of the synthetic summary event a condensation contributes to the view.
pub fn summary_event_id(condensation_id: &EventId) -> EventId {
    EventId::from_string(format!("{condensation_id}-summary"))
}

/// Events the model should see: forgotten events and non-convertible events
/// are dropped, and the most recent condensation summary is spliced in at its
/// offset.
pub fn condensed_view(events: &[Event]) -> Vec<Event> {
    let mut forgotten: HashSet<&EventId> = HashSet::new();
    let mut latest_summary = None;
    for event in events {
        if let EventKind::Condensation(condensation) = &event.kind {
            forgotten.extend(condensation.forgotten_event_ids.iter());
            latest_summary = condensation
                .summary
                .as_ref()
                .map(|summary| (event, summary, condensation.summary_offset.unwrap_or(0)));
        }
    }

    let mut view: Vec<Event> = events
        .iter()
        .filter(|event| event.kind.is_llm_convertible() && !forgotten.contains(&event.id))
        .cloned()
        .collect();

    if let Some((condensation, summary, offset)) = latest_summary {
        let summary_id = summary_event_id(&condensation.id);
        if !forgotten.contains(&summary_id) {
            let summary_event = Event {
                id: summary_id,
                timestamp: condensation.timestamp,
                source: EventSource::Environment,
                kind: EventKind::CondensationSummary(CondensationSummaryEvent {
                    summary: summary.clone(),
                }),
            };
            view.insert(offset.min(view.len()), summary_event);
        }
    }
    view
}

/// Fields of a proposed tool call that shape the assistant message.
fn proposal(event: &Event) -> Option<Proposal<'_>> {
    match &event.kind {
        EventKind::Action(action) => Some(Proposal {
            response_id: &action.llm_response_id,
            thought: &action.thought,
            reasoning_content: &action.reasoning_content,
            thinking_blocks: &action.thinking_blocks,
            tool_calls: std::slice::from_ref(&action.tool_call),
        }),
        EventKind::NonExecutableAction(action) => Some(Proposal {
            response_id: &action.llm_response_id,
            thought: &action.thought,
            reasoning_content: &action.reasoning_content,
            thinking_blocks: &action.thinking_blocks,
            tool_calls: &action.tool_calls,
        }),
        _ => None,
    }
}

struct Proposal<'a> {
    response_id: &'a ResponseId,
    thought: &'a str,
    reasoning_content: &'a Option<String>,
    thinking_blocks: &'a [String],
    tool_calls: &'a [ToolCallRequest],
}

/// Convert a view into chat messages.
///
/// Proposed calls from one model turn, executable or not, are regrouped into
/// a single assistant message. Tool results whose call never appeared, and
/// calls that never got a result, are dropped so the transcript stays
/// well-formed after condensation.
pub fn events_to_messages(view: &[Event]) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(view.len());
    let mut index = 0;
    while index < view.len() {
        let event = &view[index];
        match &event.kind {
            EventKind::SystemPrompt(prompt) => {
                messages.push(LlmMessage::system(prompt.system_prompt.clone()));
            }
            EventKind::Message(message) => {
                let mut llm_message = message.llm_message.clone();
                for extra in &message.extended_content {
                    llm_message.content.push_str("\n\n");
                    llm_message.content.push_str(extra);
                }
                messages.push(llm_message);
            }
            EventKind::Action(_) | EventKind::NonExecutableAction(_) => {
                let Some(first) = proposal(event) else {
                    index += 1;
                    continue;
                };
                let mut message = LlmMessage::assistant(first.thought)
                    .with_tool_calls(first.tool_calls.to_vec());
                message.reasoning_content = first.reasoning_content.clone();
                message.thinking_blocks = first.thinking_blocks.to_vec();
                while let Some(next) = view.get(index + 1).and_then(proposal) {
                    if next.response_id != first.response_id {
                        break;
                    }
                    message.tool_calls.extend_from_slice(next.tool_calls);
                    index += 1;
                }
                messages.push(message);
            }
            EventKind::Observation(observation) => messages.push(LlmMessage::tool_result(
                observation.tool_call_id.as_str(),
                observation.tool_name.clone(),
                observation.observation.to_llm_content(),
            )),
            EventKind::AgentError(error) => messages.push(LlmMessage::tool_result(
                error.tool_call_id.as_str(),
                error.tool_name.clone(),
                error.error.clone(),
            )),
            EventKind::UserReject(rejection) => messages.push(LlmMessage::tool_result(
                rejection.tool_call_id.as_str(),
                rejection.tool_name.clone(),
                format!("Action rejected by user: {}", rejection.rejection_reason),
            )),
            EventKind::CondensationSummary(summary) => messages.push(LlmMessage::user(format!(
                "Summary of earlier conversation: {}",
                summary.summary
            ))),
            EventKind::Condensation(_) | EventKind::Pause(_) | EventKind::StateUpdate(_) => {}
        }
        index += 1;
    }
    drop_unpaired_tool_calls(messages)
}

fn drop_unpaired_tool_calls(messages: Vec<LlmMessage>) -> Vec<LlmMessage> {
    let answered: HashSet<String> = messages
        .iter()
        .filter(|message| message.role == MessageRole::Tool)
        .filter_map(|message| message.tool_call_id.clone())
        .collect();

    let mut issued = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    for mut message in messages {
        match message.role {
            MessageRole::Assistant if !message.tool_calls.is_empty() => {
                message.tool_calls.retain(|call| answered.contains(&call.id));
                if message.tool_calls.is_empty() {
                    continue;
                }
                issued.extend(message.tool_calls.iter().map(|call| call.id.clone()));
                kept.push(message);
            }
            MessageRole::Tool => {
                let paired = message
                    .tool_call_id
                    .as_ref()
                    .is_some_and(|id| issued.remove(id));
                if paired {
                    kept.push(message);
                }
            }
            _ => kept.push(message),
        }
    }
    kept
}
