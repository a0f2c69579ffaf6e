//! # loom-conversation — facades over an agent conversation
//!
//! A [`Conversation`] is driven either in-process ([`LocalConversation`]) or
//! against an agent server over REST plus a WebSocket event stream
//! ([`RemoteConversation`]). Both notify the same kind of ordered event
//! callbacks.
//!
//! ## Module Overview
//!
//! - [`local`] — LocalConversation and its builder
//! - [`remote`] — RemoteConversation, the REST client and the WebSocket manager
//! - [`callbacks`] — Callback chain and the terminal visualizer
//! - [`wire`] — Request and response bodies shared with the server

pub mod callbacks;
pub mod local;
pub mod remote;
pub mod wire;

use async_trait::async_trait;
use loom_protocol::{AgentStatus, ConversationId, ConversationResult, Event};
use loom_security::ConfirmationPolicy;

pub use callbacks::{CallbackChain, EventCallback, Visualizer};
pub use local::{ConversationBuilder, LocalConversation};
pub use remote::{ReconnectConfig, RemoteConfig, RemoteConversation, RemoteError, RestClient};

/// Operations shared by local and remote conversations.
#[async_trait]
pub trait Conversation: Send + Sync {
    fn id(&self) -> &ConversationId;

    /// Append an observer after the ones already registered.
    fn add_callback(&self, callback: EventCallback);

    /// Append a user message. A finished conversation becomes idle again.
    async fn send_message(&self, content: &str) -> ConversationResult<()>;

    /// Drive the agent until it finishes, pauses, waits for confirmation or
    /// fails. Running while confirmation is pending accepts the actions.
    async fn run(&self) -> ConversationResult<()>;

    async fn pause(&self) -> ConversationResult<()>;

    async fn status(&self) -> ConversationResult<AgentStatus>;

    async fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> ConversationResult<()>;

    async fn set_confirmation_mode(&self, enabled: bool) -> ConversationResult<()> {
        let policy = if enabled {
            ConfirmationPolicy::AlwaysConfirm
        } else {
            ConfirmationPolicy::NeverConfirm
        };
        self.set_confirmation_policy(policy).await
    }

    async fn reject_pending_actions(&self, reason: &str) -> ConversationResult<()>;

    async fn events(&self) -> ConversationResult<Vec<Event>>;

    async fn close(&self) -> ConversationResult<()>;
}
