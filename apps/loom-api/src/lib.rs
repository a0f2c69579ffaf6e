//! # loom-api — agent server
//!
//! Hosts [`LocalConversation`]s behind the REST + WebSocket contract that
//! `RemoteConversation` speaks. Every hosted conversation gets an
//! [`EventStreamHub`] fed by a conversation callback; WebSocket clients
//! receive a `full_state` snapshot and then every event in append order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use loom_agent::Agent;
use loom_conversation::wire::{
    ConfirmationResponseRequest, ConversationInfo, DEFAULT_PAGE_LIMIT, ErrorResponse, EventPage,
    SendMessageRequest, StartConversationRequest, SuccessResponse,
};
use loom_conversation::{Conversation, LocalConversation};
use loom_events::EventStreamHub;
use loom_protocol::{ConversationError, ConversationId, Event, EventId};
use loom_security::ConfirmationPolicy;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

const MAX_PAGE_LIMIT: usize = 1_000;
const DEFAULT_REJECTION_REASON: &str = "User rejected the action";

/// What every conversation the server creates is built from.
#[derive(Clone)]
pub struct ServerConfig {
    pub agent: Agent,
    /// Conversations are persisted here when set.
    pub persistence_root: Option<PathBuf>,
    pub workspace_root: PathBuf,
    /// Per-conversation broadcast buffer for WebSocket subscribers.
    pub event_buffer: usize,
}

impl ServerConfig {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            persistence_root: None,
            workspace_root: PathBuf::from("."),
            event_buffer: 1_024,
        }
    }
}

#[derive(Clone)]
struct HostedConversation {
    conversation: Arc<LocalConversation>,
    hub: EventStreamHub,
    /// Flipped on delete so attached sockets hang up.
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    conversations: Arc<RwLock<HashMap<ConversationId, HostedConversation>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }

    /// Re-host every conversation persisted under the persistence root.
    pub async fn restore_persisted(&self) -> anyhow::Result<usize> {
        let Some(root) = &self.config.persistence_root else {
            return Ok(0);
        };
        if !root.is_dir() {
            return Ok(0);
        }
        let mut restored = 0;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = ConversationId::from_string(entry.file_name().to_string_lossy().into_owned());
            if !loom_agent::ConversationState::exists(root, &id) {
                continue;
            }
            match self.host(id.clone(), &StartConversationRequest::default()).await {
                Ok(_) => restored += 1,
                Err(error) => warn!(conversation_id = %id, %error, "failed to restore conversation"),
            }
        }
        info!(restored, root = %root.display(), "persisted conversations restored");
        Ok(restored)
    }

    async fn host(
        &self,
        id: ConversationId,
        request: &StartConversationRequest,
    ) -> Result<HostedConversation, ConversationError> {
        let hub = EventStreamHub::new(self.config.event_buffer);
        let publisher = hub.clone();
        let mut builder = LocalConversation::builder(self.config.agent.clone())
            .conversation_id(id.clone())
            .workspace_root(self.config.workspace_root.clone())
            .callback(Arc::new(move |event: &Event| publisher.publish(event.clone())));
        if let Some(root) = &self.config.persistence_root {
            builder = builder.persistence_root(root.clone());
        }
        if let Some(max_iterations) = request.max_iterations {
            builder = builder.max_iterations(max_iterations);
        }
        if let Some(policy) = request.confirmation_policy {
            builder = builder.confirmation_policy(policy);
        }
        if let Some(enabled) = request.stuck_detection {
            builder = builder.stuck_detection(enabled);
        }
        let hosted = HostedConversation {
            conversation: Arc::new(builder.build()?),
            hub,
            closed: Arc::new(watch::channel(false).0),
        };
        self.conversations.write().await.insert(id, hosted.clone());
        Ok(hosted)
    }

    async fn hosted(&self, id: &ConversationId) -> ApiResult<HostedConversation> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("conversation not found: {id}")))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/conversations",
            get(list_conversations).post(start_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/events", post(send_message))
        .route("/api/conversations/{id}/events/search", get(search_events))
        .route(
            "/api/conversations/{id}/events/respond_to_confirmation",
            post(respond_to_confirmation),
        )
        .route("/api/conversations/{id}/run", post(run_conversation))
        .route("/api/conversations/{id}/pause", post(pause_conversation))
        .route(
            "/api/conversations/{id}/confirmation_policy",
            post(set_confirmation_policy),
        )
        .route("/sockets/events/{id}", get(stream_events_ws))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ConversationError> for ApiError {
    fn from(error: ConversationError) -> Self {
        let status = match &error {
            ConversationError::EventNotFound(_) | ConversationError::IndexOutOfRange { .. } => {
                StatusCode::NOT_FOUND
            }
            ConversationError::InvalidState(_) => StatusCode::CONFLICT,
            ConversationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn conversation_info(conversation: &LocalConversation) -> ApiResult<ConversationInfo> {
    Ok(ConversationInfo {
        id: conversation.id().clone(),
        agent_status: conversation.status().await?,
        running: conversation.is_running(),
        last_error: conversation.last_error(),
        state: conversation.snapshot_map().await,
    })
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "loom-api"
    }))
}

#[instrument(skip(state, request))]
async fn start_conversation(
    State(state): State<AppState>,
    Json(request): Json<StartConversationRequest>,
) -> ApiResult<Json<ConversationInfo>> {
    let id = request
        .conversation_id
        .clone()
        .unwrap_or_else(ConversationId::new_uuid);
    if state.conversations.read().await.contains_key(&id) {
        return Err(ApiError::from(ConversationError::InvalidState(format!(
            "conversation {id} already exists"
        ))));
    }
    let hosted = state.host(id, &request).await?;
    info!(conversation_id = %hosted.conversation.id(), "conversation started");

    if let Some(message) = &request.initial_message {
        hosted.conversation.send_message(message).await?;
        let _run = hosted.conversation.spawn_run()?;
    }
    Ok(Json(conversation_info(&hosted.conversation).await?))
}

async fn list_conversations(State(state): State<AppState>) -> ApiResult<Json<Vec<ConversationInfo>>> {
    let hosted: Vec<HostedConversation> =
        state.conversations.read().await.values().cloned().collect();
    let mut infos = Vec::with_capacity(hosted.len());
    for entry in hosted {
        infos.push(conversation_info(&entry.conversation).await?);
    }
    infos.sort_by(|left, right| left.id.cmp(&right.id));
    Ok(Json(infos))
}

async fn get_conversation(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ConversationInfo>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    Ok(Json(conversation_info(&hosted.conversation).await?))
}

#[instrument(skip(state))]
async fn delete_conversation(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SuccessResponse>> {
    let id = ConversationId::from_string(id);
    let hosted = state
        .conversations
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| ApiError::not_found(format!("conversation not found: {id}")))?;
    if hosted.conversation.is_running() {
        hosted.conversation.pause().await?;
    }
    hosted.conversation.close().await?;
    hosted.closed.send_replace(true);
    info!(conversation_id = %id, "conversation deleted");
    Ok(Json(SuccessResponse::ok()))
}

#[instrument(skip(state, request))]
async fn send_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    if request.role != "user" {
        return Err(ApiError::bad_request(format!(
            "unsupported message role: {}",
            request.role
        )));
    }
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    hosted.conversation.send_message(&request.content).await?;
    if request.run {
        let _run = hosted.conversation.spawn_run()?;
    }
    Ok(Json(SuccessResponse::ok()))
}

#[instrument(skip(state))]
async fn run_conversation(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SuccessResponse>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    let _run = hosted.conversation.spawn_run()?;
    Ok(Json(SuccessResponse::ok()))
}

async fn pause_conversation(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SuccessResponse>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    hosted.conversation.pause().await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn set_confirmation_policy(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(policy): Json<ConfirmationPolicy>,
) -> ApiResult<Json<SuccessResponse>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    hosted.conversation.set_confirmation_policy(policy).await?;
    Ok(Json(SuccessResponse::ok()))
}

#[instrument(skip(state, request), fields(accept = request.accept))]
async fn respond_to_confirmation(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ConfirmationResponseRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    if request.accept {
        let _run = hosted.conversation.spawn_run()?;
    } else {
        let reason = request
            .reason
            .as_deref()
            .unwrap_or(DEFAULT_REJECTION_REASON);
        hosted.conversation.reject_pending_actions(reason).await?;
    }
    Ok(Json(SuccessResponse::ok()))
}

#[derive(Debug, Deserialize, Default)]
struct EventSearchQuery {
    page_id: Option<String>,
    limit: Option<usize>,
}

async fn search_events(
    Path(id): Path<String>,
    Query(query): Query<EventSearchQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<EventPage>> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    let events = hosted.conversation.events().await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    Ok(Json(paginate(events, query.page_id.map(EventId::from_string), limit)?))
}

fn paginate(events: Vec<Event>, page_id: Option<EventId>, limit: usize) -> ApiResult<EventPage> {
    let start = match &page_id {
        Some(page_id) => events
            .iter()
            .position(|event| &event.id == page_id)
            .ok_or_else(|| ApiError::not_found(format!("event not found: {page_id}")))?,
        None => 0,
    };
    let end = start.saturating_add(limit).min(events.len());
    let next_page_id = events.get(end).map(|event| event.id.clone());
    let items = events.into_iter().skip(start).take(end - start).collect();
    Ok(EventPage {
        items,
        next_page_id,
    })
}

async fn stream_events_ws(
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let hosted = state.hosted(&ConversationId::from_string(id)).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(hosted, socket)))
}

/// Subscribe before taking the snapshot so nothing emitted in between is
/// lost; a delta that also landed in the snapshot is harmless.
async fn forward_events(hosted: HostedConversation, mut socket: WebSocket) {
    let conversation_id = hosted.conversation.id().clone();
    let mut events = hosted.hub.subscribe_stream();
    let mut closed = hosted.closed.subscribe();
    let snapshot = hosted.conversation.full_state_event().await;
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }
    if *closed.borrow() {
        return;
    }
    debug!(%conversation_id, "event socket attached");

    loop {
        tokio::select! {
            _ = closed.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(%conversation_id, skipped, "event socket lagged");
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%conversation_id, %error, "event socket receive failed");
                    break;
                }
            },
        }
    }
    debug!(%conversation_id, "event socket detached");
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    socket.send(Message::Text(payload.into())).await
}

#[cfg(test)]
mod tests {
    use loom_protocol::{Event, EventId};

    use super::paginate;

    #[test]
    fn pagination_walks_pages_by_event_id() -> anyhow::Result<()> {
        let events: Vec<Event> = (0..5)
            .map(|n| Event::user_message(format!("message {n}")))
            .collect();

        let first = paginate(events.clone(), None, 2).map_err(|e| anyhow::anyhow!("{e:?}"))?;
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_page_id.as_ref(), Some(&events[2].id));

        let last = paginate(events.clone(), Some(events[4].id.clone()), 2)
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;
        assert_eq!(last.items.len(), 1);
        assert!(last.next_page_id.is_none());

        assert!(paginate(events, Some(EventId::from("missing")), 2).is_err());
        Ok(())
    }
}
