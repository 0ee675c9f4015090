//! Driftbot CLI entry point.

use clap::{Parser, Subcommand};
use driftbot::app::{AppContext, Collaborators};
use driftbot::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "driftbot", version)]
#[command(about = "Core runtime for a conversational-agent platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the platform in the foreground (default)
    Start,
    /// Validate the configuration and exit
    CheckConfig,
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "driftbot=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Start) {
        Command::CheckConfig => {
            // Config::load already validated; reaching here means it's fine.
            println!("configuration ok");
            println!("data dir: {}", config.data_dir.display());
            println!("plugins dir: {}", config.plugins_dir.display());
            Ok(())
        }
        Command::Start => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Concrete model/embedding/vector providers are wired by the embedding
    // application; standalone runs use placeholders whose failures follow
    // the documented NO_OP semantics.
    let app = AppContext::build(config, Collaborators::unconfigured()).await?;

    let mut http_task = None;
    if app.config.adapter_http.enable {
        let runtime = app.runtime.clone();
        let bind = app.config.adapter_http.bind.clone();
        http_task = Some(tokio::spawn(async move {
            if let Err(error) = driftbot::bus::http::serve(runtime, &bind).await {
                tracing::error!(%error, "adapter HTTP endpoint failed");
            }
        }));
    }

    tracing::info!("driftbot running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    if let Some(task) = http_task {
        task.abort();
    }
    app.shutdown().await;
    Ok(())
}
