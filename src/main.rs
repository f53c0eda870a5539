use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jinx::config;
use jinx::engine::Engine;

#[derive(Parser)]
#[command(name = "jinx")]
#[command(version, about = "Multi-mode network server: HTTP origin, reverse/forward proxy, L4 load balancer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to jinx_config.json under the base directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured engine and serve until shutdown
    Start,

    /// Signal graceful shutdown of a running engine
    Stop,

    /// Stop the engine, then start a fresh serving loop
    Restart,

    /// Stop the engine and delete its working directory (irreversible)
    Destroy,

    /// Print the version string
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("Jinx Version {}", config::VERSION);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let base = config::base_dir();
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join(config::CONFIG_FILE));

    let config = config::load(&config_path)?;
    let engine = Engine::from_config(&config, &base).await?;

    match cli.command {
        Commands::Start => {
            engine.start().await?;
            engine.wait().await;
        }
        Commands::Stop => engine.stop().await,
        Commands::Restart => {
            engine.restart().await?;
            engine.wait().await;
        }
        Commands::Destroy => engine.destroy().await,
        Commands::Version => unreachable!("handled before the runtime starts"),
    }

    Ok(())
}
