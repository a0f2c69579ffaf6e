use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use loom_agent::{Agent, ScriptedLlm};
use loom_api::{AppState, ServerConfig, router};
use loom_conversation::wire::StartConversationRequest;
use loom_conversation::{
    Conversation, EventCallback, ReconnectConfig, RemoteConfig, RemoteConversation, RestClient,
};
use loom_protocol::{
    AgentStatus, ConversationId, ConversationResult, Event, EventKind, Llm, LlmMessage,
    LlmResponse, ToolCallRequest, ToolSpec,
};
use loom_security::ConfirmationPolicy;
use parking_lot::Mutex;
use serde_json::json;

async fn serve(agent: Agent) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(AppState::new(ServerConfig::new(agent)));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn remote_config(addr: SocketAddr) -> RemoteConfig {
    let mut config = RemoteConfig::new(format!("http://{addr}"));
    config.poll_interval = Duration::from_millis(20);
    config.run_timeout = Duration::from_secs(10);
    config.stop_timeout = Duration::from_millis(500);
    config.reconnect = ReconnectConfig {
        initial_ms: 20,
        max_ms: 200,
        multiplier: 2.0,
        jitter_ms: 10,
    };
    config
}

fn recorder() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event: &Event| sink.lock().push(event.clone()));
    (callback, seen)
}

async fn wait_for(seen: &Mutex<Vec<Event>>, predicate: impl Fn(&[Event]) -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if predicate(&seen.lock()) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("condition not reached over the event stream"))
}

/// Answers every call after a delay, so a run stays active long enough to
/// observe it.
struct SlowLlm;

#[async_trait]
impl Llm for SlowLlm {
    fn model(&self) -> &str {
        "slow"
    }

    async fn completion(
        &self,
        _messages: &[LlmMessage],
        _tools: &[ToolSpec],
    ) -> ConversationResult<LlmResponse> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(LlmResponse::text("eventually"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_conversation_runs_to_finish_and_streams_events() -> Result<()> {
    let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::text("Hi!")]));
    let addr = serve(Agent::new(llm)).await?;
    let (callback, seen) = recorder();

    let conversation = RemoteConversation::create(
        remote_config(addr),
        StartConversationRequest::default(),
        None,
        vec![callback],
    )
    .await?;
    wait_for(&seen, |events| {
        events.first().is_some_and(|event| {
            matches!(&event.kind, EventKind::StateUpdate(update) if update.is_full_state())
        })
    })
    .await?;

    conversation.send_message("Say hi").await?;
    conversation.run().await?;
    assert_eq!(conversation.status().await?, AgentStatus::Finished);

    let events = conversation.events().await?;
    let kinds: Vec<_> = events.iter().map(|event| event.kind.name()).collect();
    assert_eq!(
        kinds,
        ["SystemPromptEvent", "MessageEvent", "ActionEvent", "ObservationEvent"]
    );

    wait_for(&seen, |events| {
        events
            .iter()
            .any(|event| matches!(event.kind, EventKind::Observation(_)))
    })
    .await?;
    let streamed: Vec<_> = seen
        .lock()
        .iter()
        .filter(|event| !matches!(event.kind, EventKind::StateUpdate(_)))
        .map(|event| event.id.clone())
        .collect();
    let logged: Vec<_> = events.iter().map(|event| event.id.clone()).collect();
    assert_eq!(streamed, logged);

    wait_for(&seen, |_| {
        conversation.cached_state().get("agent_status") == Some(&json!("finished"))
    })
    .await?;

    conversation.close().await?;
    conversation.delete().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_callback_does_not_stop_the_event_stream() -> Result<()> {
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmResponse::tool_calls(
            "",
            vec![ToolCallRequest::function(
                "call-1",
                "think",
                &json!({ "thought": "plan" }),
            )],
        ),
        LlmResponse::text("done"),
    ]));
    let addr = serve(Agent::new(llm)).await?;
    let exploding: EventCallback = Arc::new(|event: &Event| {
        if !matches!(event.kind, EventKind::StateUpdate(_)) {
            panic!("callback failed on {}", event.id);
        }
    });
    let (recording, seen) = recorder();
    let config = remote_config(addr);
    let stop_timeout = config.stop_timeout;

    let conversation = RemoteConversation::create(
        config,
        StartConversationRequest::default(),
        None,
        vec![exploding, recording],
    )
    .await?;
    conversation.send_message("plan, then finish").await?;
    conversation.run().await?;

    let logged: Vec<_> = conversation
        .events()
        .await?
        .into_iter()
        .map(|event| event.id)
        .collect();
    assert_eq!(logged.len(), 6);
    wait_for(&seen, |events| {
        events
            .iter()
            .filter(|event| !matches!(event.kind, EventKind::StateUpdate(_)))
            .count()
            == logged.len()
    })
    .await?;
    let streamed: Vec<_> = seen
        .lock()
        .iter()
        .filter(|event| !matches!(event.kind, EventKind::StateUpdate(_)))
        .map(|event| event.id.clone())
        .collect();
    assert_eq!(streamed, logged);
    assert!(conversation.is_streaming());

    let started = tokio::time::Instant::now();
    conversation.close().await?;
    assert!(started.elapsed() < stop_timeout + Duration::from_millis(250));
    assert!(!conversation.is_streaming());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_stream_gives_up_once_the_conversation_is_deleted() -> Result<()> {
    let addr = serve(Agent::new(Arc::new(ScriptedLlm::new(Vec::new())))).await?;
    let config = remote_config(addr);
    let rest = RestClient::new(&config)?;
    let conversation =
        RemoteConversation::create(config, StartConversationRequest::default(), None, Vec::new())
            .await?;
    assert!(conversation.is_streaming());

    rest.delete_conversation(conversation.id()).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while conversation.is_streaming() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!conversation.is_streaming());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_rejection_resolves_pending_actions() -> Result<()> {
    let llm = Arc::new(ScriptedLlm::new(vec![LlmResponse::tool_calls(
        "",
        vec![ToolCallRequest::function(
            "call-1",
            "think",
            &json!({ "thought": "check first" }),
        )],
    )]));
    let addr = serve(Agent::new(llm)).await?;
    let request = StartConversationRequest {
        confirmation_policy: Some(ConfirmationPolicy::AlwaysConfirm),
        ..StartConversationRequest::default()
    };
    let conversation = RemoteConversation::create(remote_config(addr), request, None, Vec::new()).await?;

    conversation.send_message("think about it").await?;
    conversation.run().await?;
    assert_eq!(
        conversation.status().await?,
        AgentStatus::WaitingForConfirmation
    );

    conversation.reject_pending_actions("too risky").await?;
    assert_eq!(conversation.status().await?, AgentStatus::Idle);
    let rejected = conversation.events().await?.into_iter().any(|event| {
        matches!(&event.kind, EventKind::UserReject(rejection) if rejection.rejection_reason == "too risky")
    });
    assert!(rejected);

    conversation.set_confirmation_mode(false).await?;
    let info = conversation.info().await?;
    assert_eq!(
        info.state.get("confirmation_policy"),
        Some(&json!({ "kind": "NeverConfirm" }))
    );
    conversation.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_run_is_rejected_with_conflict() -> Result<()> {
    let addr = serve(Agent::new(Arc::new(SlowLlm))).await?;
    let rest = RestClient::new(&remote_config(addr))?;
    let info = rest
        .start_conversation(&StartConversationRequest::default())
        .await?;
    rest.send_message(&info.id, &loom_conversation::wire::SendMessageRequest::user("go"))
        .await?;

    rest.run(&info.id).await?;
    let second = rest.run(&info.id).await;
    let message = second
        .err()
        .map(|error| error.to_string())
        .unwrap_or_default();
    assert!(message.contains("HTTP 409"), "unexpected: {message}");
    assert!(message.contains("already running"));

    let conversation =
        RemoteConversation::attach(remote_config(addr), info.id.clone(), None, Vec::new()).await?;
    let finished = conversation.wait_until_idle(Duration::from_secs(5)).await?;
    assert_eq!(finished.agent_status, AgentStatus::Finished);
    conversation.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_conversation_reports_a_json_error() -> Result<()> {
    let addr = serve(Agent::new(Arc::new(ScriptedLlm::new(Vec::new())))).await?;
    let rest = RestClient::new(&remote_config(addr))?;

    let health = rest.health().await?;
    assert_eq!(health["status"], "ok");

    let missing = rest.get_conversation(&ConversationId::from("nope")).await;
    let message = missing.err().map(|error| error.to_string()).unwrap_or_default();
    assert!(message.contains("HTTP 404"));
    assert!(message.contains("conversation not found: nope"));
    Ok(())
}
