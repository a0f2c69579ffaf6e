//! Conversation hosted by an agent server.
//!
//! Commands go over REST; events arrive on a WebSocket that a background
//! task keeps connected with jittered exponential backoff. The first frame
//! of every connection is a `full_state` snapshot, which seeds the cached
//! state map that later field deltas are merged into.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use loom_protocol::{
    AgentStatus, ConversationError, ConversationId, ConversationResult, Event, EventId, EventKind,
};
use loom_security::ConfirmationPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, instrument, warn};

use crate::Conversation;
use crate::callbacks::{CallbackChain, EventCallback, Visualizer};
use crate::wire::{
    ConfirmationResponseRequest, ConversationInfo, DEFAULT_PAGE_LIMIT,
    ErrorResponse, EventPage, SendMessageRequest, StartConversationRequest, SuccessResponse,
};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<tungstenite::Error> for RemoteError {
    fn from(error: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(error))
    }
}

impl From<RemoteError> for ConversationError {
    fn from(error: RemoteError) -> Self {
        Self::Remote(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8000`.
    pub base_url: String,
    pub request_timeout: Duration,
    /// How often `run` polls the server while waiting for the agent.
    pub poll_interval: Duration,
    /// Upper bound on a single remote `run`.
    pub run_timeout: Duration,
    /// How long `close` waits for the event stream task before aborting it.
    pub stop_timeout: Duration,
    /// How long to wait for the initial snapshot after connecting.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            run_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn websocket_url(&self, id: &ConversationId) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/sockets/events/{id}")
    }
}

/// Thin typed client over the server's REST surface.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    pub async fn health(&self) -> Result<Value, RemoteError> {
        self.get_json("/healthz").await
    }

    pub async fn start_conversation(
        &self,
        request: &StartConversationRequest,
    ) -> Result<ConversationInfo, RemoteError> {
        self.post_json("/api/conversations", request).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationInfo>, RemoteError> {
        self.get_json("/api/conversations").await
    }

    pub async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationInfo, RemoteError> {
        self.get_json(&format!("/api/conversations/{id}")).await
    }

    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<SuccessResponse, RemoteError> {
        let url = format!("{}/api/conversations/{id}", self.base_url);
        let response = self.client.delete(url).send().await?;
        self.parse_response(response).await
    }

    pub async fn send_message(
        &self,
        id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<SuccessResponse, RemoteError> {
        self.post_json(&format!("/api/conversations/{id}/events"), request)
            .await
    }

    pub async fn run(&self, id: &ConversationId) -> Result<SuccessResponse, RemoteError> {
        self.post_json(&format!("/api/conversations/{id}/run"), &Value::Null)
            .await
    }

    pub async fn pause(&self, id: &ConversationId) -> Result<SuccessResponse, RemoteError> {
        self.post_json(&format!("/api/conversations/{id}/pause"), &Value::Null)
            .await
    }

    pub async fn set_confirmation_policy(
        &self,
        id: &ConversationId,
        policy: ConfirmationPolicy,
    ) -> Result<SuccessResponse, RemoteError> {
        self.post_json(
            &format!("/api/conversations/{id}/confirmation_policy"),
            &policy,
        )
        .await
    }

    pub async fn respond_to_confirmation(
        &self,
        id: &ConversationId,
        request: &ConfirmationResponseRequest,
    ) -> Result<SuccessResponse, RemoteError> {
        self.post_json(
            &format!("/api/conversations/{id}/events/respond_to_confirmation"),
            request,
        )
        .await
    }

    pub async fn search_events(
        &self,
        id: &ConversationId,
        page_id: Option<&EventId>,
        limit: usize,
    ) -> Result<EventPage, RemoteError> {
        let mut path = format!("/api/conversations/{id}/events/search?limit={limit}");
        if let Some(page_id) = page_id {
            path.push_str(&format!("&page_id={page_id}"));
        }
        self.get_json(&path).await
    }

    /// Walk every page of the event search.
    pub async fn all_events(&self, id: &ConversationId) -> Result<Vec<Event>, RemoteError> {
        let mut events = Vec::new();
        let mut page_id: Option<EventId> = None;
        loop {
            let page = self
                .search_events(id, page_id.as_ref(), DEFAULT_PAGE_LIMIT)
                .await?;
            events.extend(page.items);
            match page.next_page_id {
                Some(next) => page_id = Some(next),
                None => return Ok(events),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(url).send().await?;
        self.parse_response(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(url).json(body).send().await?;
        self.parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let text = response.text().await?;
        if let Ok(server_error) = serde_json::from_str::<ErrorResponse>(&text) {
            return Err(RemoteError::InvalidResponse(format!(
                "HTTP {}: {}",
                status.as_u16(),
                server_error.error
            )));
        }
        Err(RemoteError::InvalidResponse(format!(
            "HTTP {}: {}",
            status.as_u16(),
            text
        )))
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    base_ms.saturating_add(nanos % jitter_ms)
}

/// The server refused the upgrade outright, e.g. the conversation is gone.
fn is_rejected_upgrade(error: &tungstenite::Error) -> bool {
    matches!(error, tungstenite::Error::Http(response) if response.status().is_client_error())
}

fn next_backoff(current_ms: u64, reconnect: &ReconnectConfig) -> u64 {
    let next = (current_ms as f64 * reconnect.multiplier) as u64;
    next.min(reconnect.max_ms)
}

/// Background task holding the event WebSocket open until stopped.
#[derive(Debug)]
struct EventStreamTask {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventStreamTask {
    fn spawn(
        url: String,
        reconnect: ReconnectConfig,
        cache: Arc<Mutex<Map<String, Value>>>,
        callbacks: Arc<CallbackChain>,
        ready: watch::Sender<bool>,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut backoff = reconnect.initial_ms;
            loop {
                if *stopped.borrow() {
                    break;
                }
                let connected = tokio::select! {
                    connected = connect_async(url.as_str()) => connected,
                    _ = stopped.changed() => break,
                };
                match connected {
                    Ok((mut stream, _)) => {
                        debug!(%url, "event stream connected");
                        backoff = reconnect.initial_ms;
                        loop {
                            let message = tokio::select! {
                                message = stream.next() => message,
                                _ = stopped.changed() => None,
                            };
                            let Some(message) = message else {
                                break;
                            };
                            match message {
                                Ok(Message::Text(text)) => match serde_json::from_str::<Event>(&text) {
                                    Ok(event) => {
                                        if let EventKind::StateUpdate(update) = &event.kind {
                                            update.apply_to(&mut cache.lock());
                                            if update.is_full_state() {
                                                ready.send_replace(true);
                                            }
                                        }
                                        callbacks.dispatch(&event);
                                    }
                                    Err(error) => warn!(%error, "undecodable event frame"),
                                },
                                Ok(Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(error) => {
                                    let error = RemoteError::from(error);
                                    warn!(%error, "event stream failed");
                                    break;
                                }
                            }
                        }
                        if *stopped.borrow() {
                            let _ = stream.close(None).await;
                            break;
                        }
                        info!(%url, "event stream disconnected");
                    }
                    Err(error) if is_rejected_upgrade(&error) => {
                        let error = RemoteError::from(error);
                        warn!(%url, %error, "event stream rejected by server; not reconnecting");
                        break;
                    }
                    Err(error) => {
                        let error = RemoteError::from(error);
                        warn!(%url, %error, "event stream connect failed");
                    }
                }

                let delay = jittered_backoff(backoff, reconnect.jitter_ms);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = stopped.changed() => break,
                }
                backoff = next_backoff(backoff, &reconnect);
            }
            debug!(%url, "event stream task stopped");
        });
        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task and wait up to `timeout` for it to exit; abort it
    /// otherwise.
    async fn stop(&self, timeout: Duration) {
        self.stop.send_replace(true);
        let Some(mut handle) = self.handle.lock().take() else {
            return;
        };
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("event stream task did not stop in time; aborting");
            handle.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for EventStreamTask {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Conversation proxy for an agent server.
pub struct RemoteConversation {
    id: ConversationId,
    config: RemoteConfig,
    rest: RestClient,
    callbacks: Arc<CallbackChain>,
    cache: Arc<Mutex<Map<String, Value>>>,
    stream: EventStreamTask,
}

impl RemoteConversation {
    /// Create a conversation on the server and subscribe to its events. The
    /// initial message, if any, is sent after the subscription is live so
    /// no event is missed.
    #[instrument(skip_all, fields(base_url = %config.base_url))]
    pub async fn create(
        config: RemoteConfig,
        mut request: StartConversationRequest,
        visualizer: Option<Visualizer>,
        callbacks: Vec<EventCallback>,
    ) -> ConversationResult<Self> {
        let rest = RestClient::new(&config)?;
        let initial_message = request.initial_message.take();
        let info = rest.start_conversation(&request).await?;
        info!(conversation_id = %info.id, "remote conversation created");
        let conversation = Self::subscribe(config, rest, info, visualizer, callbacks).await;
        if let Some(message) = initial_message {
            conversation.send_message(&message).await?;
            conversation.run().await?;
        }
        Ok(conversation)
    }

    /// Attach to a conversation that already exists on the server.
    pub async fn attach(
        config: RemoteConfig,
        id: ConversationId,
        visualizer: Option<Visualizer>,
        callbacks: Vec<EventCallback>,
    ) -> ConversationResult<Self> {
        let rest = RestClient::new(&config)?;
        let info = rest.get_conversation(&id).await?;
        Ok(Self::subscribe(config, rest, info, visualizer, callbacks).await)
    }

    async fn subscribe(
        config: RemoteConfig,
        rest: RestClient,
        info: ConversationInfo,
        visualizer: Option<Visualizer>,
        user_callbacks: Vec<EventCallback>,
    ) -> Self {
        let mut callbacks = Vec::with_capacity(user_callbacks.len() + 1);
        if let Some(visualizer) = visualizer {
            callbacks.push(visualizer.into_callback());
        }
        callbacks.extend(user_callbacks);
        let callbacks = Arc::new(CallbackChain::new(callbacks));
        let cache = Arc::new(Mutex::new(info.state));

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let stream = EventStreamTask::spawn(
            config.websocket_url(&info.id),
            config.reconnect,
            Arc::clone(&cache),
            Arc::clone(&callbacks),
            ready_tx,
        );
        let ready = matches!(
            tokio::time::timeout(config.connect_timeout, ready_rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        if !ready {
            warn!(conversation_id = %info.id, "no state snapshot before connect timeout");
        }

        Self {
            id: info.id,
            config,
            rest,
            callbacks,
            cache,
            stream,
        }
    }

    /// Whether the background event stream task is still alive.
    pub fn is_streaming(&self) -> bool {
        self.stream.is_running()
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Last state pushed over the event stream.
    pub fn cached_state(&self) -> Map<String, Value> {
        self.cache.lock().clone()
    }

    pub async fn info(&self) -> ConversationResult<ConversationInfo> {
        Ok(self.rest.get_conversation(&self.id).await?)
    }

    /// Poll until the server reports no active run.
    pub async fn wait_until_idle(&self, timeout: Duration) -> ConversationResult<ConversationInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info = self.info().await?;
            if !info.running {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConversationError::Timeout(format!(
                    "conversation {} still running after {:?}",
                    self.id, timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Remove the conversation from the server and stop listening.
    pub async fn delete(&self) -> ConversationResult<()> {
        self.stream.stop(self.config.stop_timeout).await;
        self.rest.delete_conversation(&self.id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RemoteConversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConversation")
            .field("id", &self.id)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Conversation for RemoteConversation {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn add_callback(&self, callback: EventCallback) {
        self.callbacks.push(callback);
    }

    async fn send_message(&self, content: &str) -> ConversationResult<()> {
        self.rest
            .send_message(&self.id, &SendMessageRequest::user(content))
            .await?;
        Ok(())
    }

    /// Start a run on the server and block until it is no longer running.
    async fn run(&self) -> ConversationResult<()> {
        self.rest.run(&self.id).await?;
        let info = self.wait_until_idle(self.config.run_timeout).await?;
        match info.last_error {
            Some(error) if info.agent_status == AgentStatus::Error => {
                Err(ConversationError::Remote(error))
            }
            _ => Ok(()),
        }
    }

    async fn pause(&self) -> ConversationResult<()> {
        self.rest.pause(&self.id).await?;
        Ok(())
    }

    async fn status(&self) -> ConversationResult<AgentStatus> {
        Ok(self.info().await?.agent_status)
    }

    async fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> ConversationResult<()> {
        self.rest.set_confirmation_policy(&self.id, policy).await?;
        Ok(())
    }

    async fn reject_pending_actions(&self, reason: &str) -> ConversationResult<()> {
        let request = ConfirmationResponseRequest {
            accept: false,
            reason: Some(reason.to_owned()),
        };
        self.rest.respond_to_confirmation(&self.id, &request).await?;
        Ok(())
    }

    async fn events(&self) -> ConversationResult<Vec<Event>> {
        Ok(self.rest.all_events(&self.id).await?)
    }

    async fn close(&self) -> ConversationResult<()> {
        self.stream.stop(self.config.stop_timeout).await;
        debug!(conversation_id = %self.id, "remote conversation closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use loom_protocol::ConversationId;

    use super::{ReconnectConfig, RemoteConfig, jittered_backoff, next_backoff};

    #[test]
    fn websocket_url_follows_the_http_scheme() {
        let id = ConversationId::from("abc");
        assert_eq!(
            RemoteConfig::new("http://127.0.0.1:8000/").websocket_url(&id),
            "ws://127.0.0.1:8000/sockets/events/abc"
        );
        assert_eq!(
            RemoteConfig::new("https://agents.example").websocket_url(&id),
            "wss://agents.example/sockets/events/abc"
        );
    }

    #[test]
    fn backoff_grows_to_the_cap_with_bounded_jitter() {
        let reconnect = ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 3.0,
            jitter_ms: 50,
        };
        let mut backoff = reconnect.initial_ms;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(backoff);
            backoff = next_backoff(backoff, &reconnect);
        }
        assert_eq!(seen, [100, 300, 900, 1_000]);

        let delay = jittered_backoff(100, 50);
        assert!((100..150).contains(&delay));
        assert_eq!(jittered_backoff(100, 0), 100);
    }
}
