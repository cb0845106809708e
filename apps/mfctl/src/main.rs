// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use manifold_shm::SharedPage;
use manifold_stats::Aggregator;
use manifold_stream::capa::{publish_capabilities, publish_stream_config};
use manifold_stream::sanitize_name;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

mod config;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "mfctl", version, about = "Manifold controller")]
struct Cli {
    /// Path to the configuration blob
    #[arg(short, long, default_value = "manifold.json")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish capabilities and stream configs, run the statistics
    /// aggregator
    Serve,
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Generate a default config blob and print it to stdout
    Default,
}

fn unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Serializes the configuration into the shared pages every other process
/// reads. The returned pages must stay alive for the duration of the run.
fn publish_pages(cfg: &config::Config) -> anyhow::Result<Vec<SharedPage>> {
    let mut pages = Vec::new();
    pages.push(publish_capabilities(&config::capabilities(cfg))?);
    for (name, entry) in &cfg.streams {
        let base = sanitize_name(name);
        let blob = serde_json::to_value(entry)?;
        pages.push(publish_stream_config(&base, &blob)?);
        info!(stream = %base, source = %entry.source, "stream config published");
    }
    Ok(pages)
}

async fn serve(config_path: &str) -> anyhow::Result<()> {
    let loaded = config::load(config_path).map_err(|e| anyhow::anyhow!("{e}"))?;
    let _log_guard = logging::init_logging(&loaded.config.log)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    if let Some(missing) = &loaded.file_missing {
        warn!(config_path = %missing, "config file not found, using defaults");
    }
    info!(streams = loaded.config.streams.len(), "starting controller");

    let _pages = publish_pages(&loaded.config)?;
    let mut aggregator = Aggregator::create()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut summary_countdown = 30u32;

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                aggregator.tick(unix_secs());
                summary_countdown -= 1;
                if summary_countdown == 0 {
                    summary_countdown = 30;
                    let active = aggregator.active_streams(unix_secs());
                    info!(
                        sessions = aggregator.session_count(),
                        active_streams = active.len(),
                        "statistics summary"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination requested, shutting down");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => {
            if let Err(e) = serve(&cli.config).await {
                error!(error = %e, "controller failed");
                std::process::exit(1);
            }
        },
        Commands::Config(ConfigCommands::Default) => match config::generate_default() {
            Ok(blob) => println!("{blob}"),
            Err(e) => {
                eprintln!("failed to generate default config: {e}");
                std::process::exit(1);
            },
        },
    }
}
