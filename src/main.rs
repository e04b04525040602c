use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use greenroom::session::orchestrator::Adapters;
use greenroom::{Config, Orchestrator};

/// greenroom - live three-party voice studio server
#[derive(Parser)]
#[command(name = "greenroom", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "GREENROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address override (e.g. 0.0.0.0:9470)
    #[arg(long, env = "GREENROOM_BIND")]
    bind: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,greenroom=info",
        1 => "info,greenroom=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    let config = Arc::new(config);

    tracing::info!(
        bind = %config.server.bind,
        enhanced_audio = config.features.enhanced_audio,
        recording = config.recording.enabled,
        "starting greenroom"
    );

    // Speech backends are wired in by deployment-specific adapter crates;
    // with none configured the agents are silent and the studio still runs
    // VAD, ducking, barge-in, and routing end to end.
    let orchestrator = Orchestrator::new(Arc::clone(&config), Adapters::default());

    let shutdown_orchestrator = Arc::clone(&orchestrator);
    let bind = config.server.bind.clone();
    greenroom::gateway::serve(Arc::clone(&orchestrator), &bind, async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        if let Err(error) = shutdown_orchestrator.shutdown().await {
            tracing::error!(%error, "session teardown incomplete");
            std::process::exit(1);
        }
    })
    .await
}
