use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loom_agent::{Agent, ScriptedLlm};
use loom_conversation::wire::StartConversationRequest;
use loom_conversation::{Conversation, LocalConversation, RemoteConfig, RemoteConversation, Visualizer};
use loom_protocol::ConversationId;
use loom_security::ConfirmationPolicy;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "loomd")]
#[command(about = "Drive loom conversations from the terminal")]
struct Cli {
    /// Agent server base URL.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a conversation on the server, optionally sending a first message.
    Start {
        #[arg(long)]
        message: Option<String>,
        /// Ask before executing any action.
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Send a message and run until the agent stops.
    Send {
        conversation: String,
        message: String,
        /// Only append the message.
        #[arg(long)]
        no_run: bool,
    },
    /// Run; accepts pending actions when confirmation is awaited.
    Run { conversation: String },
    Pause { conversation: String },
    /// Reject every pending action.
    Reject {
        conversation: String,
        #[arg(long, default_value = "User rejected the action")]
        reason: String,
    },
    Status { conversation: String },
    /// Print the conversation's event log.
    Events { conversation: String },
    /// Run a conversation in-process against a replay script.
    Local {
        #[arg(long)]
        llm_script: PathBuf,
        message: String,
        /// Persist under this directory; reuse `--conversation` to resume.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = RemoteConfig::new(&cli.server);

    match cli.command {
        Command::Start {
            message,
            confirm,
            max_iterations,
        } => {
            let request = StartConversationRequest {
                max_iterations,
                confirmation_policy: confirm.then_some(ConfirmationPolicy::AlwaysConfirm),
                initial_message: message,
                ..StartConversationRequest::default()
            };
            let conversation =
                RemoteConversation::create(config, request, Some(Visualizer::stdout()), Vec::new())
                    .await
                    .context("failed creating conversation")?;
            println!("conversation {}", conversation.id());
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Send {
            conversation,
            message,
            no_run,
        } => {
            let conversation = attach(config, conversation).await?;
            conversation.send_message(&message).await?;
            if !no_run {
                conversation.run().await?;
            }
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Run { conversation } => {
            let conversation = attach(config, conversation).await?;
            conversation.run().await?;
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Pause { conversation } => {
            let conversation = attach_quiet(config, conversation).await?;
            conversation.pause().await?;
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Reject {
            conversation,
            reason,
        } => {
            let conversation = attach(config, conversation).await?;
            conversation.reject_pending_actions(&reason).await?;
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Status { conversation } => {
            let conversation = attach_quiet(config, conversation).await?;
            report_status(&conversation).await?;
            conversation.close().await?;
        }
        Command::Events { conversation } => {
            let conversation = attach_quiet(config, conversation).await?;
            let visualizer = Visualizer::stdout();
            for event in conversation.events().await? {
                visualizer.render(&event);
            }
            conversation.close().await?;
        }
        Command::Local {
            llm_script,
            message,
            root,
            conversation,
        } => run_local(llm_script, message, root, conversation).await?,
    }

    Ok(())
}

async fn attach(config: RemoteConfig, id: String) -> Result<RemoteConversation> {
    RemoteConversation::attach(
        config,
        ConversationId::from_string(id),
        Some(Visualizer::stdout()),
        Vec::new(),
    )
    .await
    .context("failed attaching to conversation")
}

async fn attach_quiet(config: RemoteConfig, id: String) -> Result<RemoteConversation> {
    RemoteConversation::attach(config, ConversationId::from_string(id), None, Vec::new())
        .await
        .context("failed attaching to conversation")
}

async fn report_status(conversation: &dyn Conversation) -> Result<()> {
    let status = conversation.status().await?;
    println!("status: {status}");
    Ok(())
}

async fn run_local(
    llm_script: PathBuf,
    message: String,
    root: Option<PathBuf>,
    conversation: Option<String>,
) -> Result<()> {
    let llm = ScriptedLlm::from_json_file(&llm_script)
        .with_context(|| format!("failed loading llm script {}", llm_script.display()))?;
    let mut builder = LocalConversation::builder(Agent::new(Arc::new(llm))).visualize(true);
    if let Some(root) = root {
        builder = builder.persistence_root(root);
    }
    if let Some(id) = conversation {
        builder = builder.conversation_id(ConversationId::from_string(id));
    }
    let conversation = builder.build()?;
    info!(conversation_id = %conversation.id(), "local conversation ready");

    conversation.send_message(&message).await?;
    if let Err(error) = conversation.run().await {
        warn!(%error, "run ended with an error");
    }
    report_status(&conversation).await?;
    conversation.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn send_runs_unless_told_otherwise() {
        let cli = Cli::try_parse_from(["loomd", "send", "conv-1", "hello"]);
        assert!(matches!(
            cli.map(|cli| cli.command),
            Ok(Command::Send { no_run: false, .. })
        ));

        let cli = Cli::try_parse_from(["loomd", "--server", "http://x:1", "send", "c", "m", "--no-run"]);
        assert!(cli.is_ok_and(|cli| cli.server == "http://x:1"
            && matches!(cli.command, Command::Send { no_run: true, .. })));
    }
}
