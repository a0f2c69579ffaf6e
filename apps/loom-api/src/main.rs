use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use loom_agent::{Agent, Condenser, ScriptedLlm};
use loom_api::{AppState, ServerConfig, router};
use loom_security::SecurityAnalyzer;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "loom-api")]
#[command(about = "loom agent server")]
struct Cli {
    /// Conversations are persisted under this directory.
    #[arg(long, default_value = ".loom")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,
    /// JSON replay file of model turns served to every conversation.
    #[arg(long)]
    llm_script: PathBuf,
    /// Directory tools operate in.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Risk analyzer: none, llm or pattern.
    #[arg(long, default_value = "none")]
    security_analyzer: String,
    /// Condense history once the view exceeds this many events.
    #[arg(long)]
    condense_after: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let llm = ScriptedLlm::from_json_file(&cli.llm_script)
        .with_context(|| format!("failed loading llm script {}", cli.llm_script.display()))?;
    let analyzer = SecurityAnalyzer::from_name(&cli.security_analyzer)
        .ok_or_else(|| anyhow!("unknown security analyzer: {}", cli.security_analyzer))?;
    let mut agent = Agent::new(Arc::new(llm)).with_security_analyzer(analyzer);
    if let Some(max_events) = cli.condense_after {
        agent = agent.with_condenser(Condenser::window(max_events));
    }

    let mut config = ServerConfig::new(agent);
    config.persistence_root = Some(cli.root.clone());
    config.workspace_root = cli.workspace.clone();
    let state = AppState::new(config);
    state.restore_persisted().await?;

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed binding {}", cli.listen))?;
    info!(listen = %cli.listen, root = %cli.root.display(), "loom-api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
