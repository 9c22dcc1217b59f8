use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use switchboard::cli::{Cli, Commands};
use switchboard::config::AppConfig;
use switchboard::coordination::ToggleDispatcher;
use switchboard::ControlPlane;
use tokio::time::Duration;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { halt_poll_secs } => run(&cli.config_dir, halt_poll_secs).await?,
        Commands::Config(cmd) => {
            init_logging_simple();
            cmd.run(&cli.config_dir)?;
        }
        Commands::Toggles => {
            init_logging_simple();
            list_toggles().await;
        }
    }

    Ok(())
}

async fn run(config_dir: &Path, halt_poll_secs: u64) -> Result<()> {
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))?;
    init_logging(&config.logging);

    info!("Starting switchboard (config: {})", config_dir.display());
    let plane = ControlPlane::new(config).await?;
    plane.start().await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut halt_check = tokio::time::interval(Duration::from_secs(halt_poll_secs.max(1)));
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break "shutdown signal";
            }
            _ = halt_check.tick() => {
                if plane.should_halt() {
                    warn!("Failsafe requested a system halt");
                    break "failsafe halt";
                }
            }
        }
    };

    plane.stop(reason).await;
    if reason == "failsafe halt" {
        error!("Switchboard halted by failsafe");
        std::process::exit(2);
    }
    Ok(())
}

async fn list_toggles() {
    let toggles = ToggleDispatcher::new();
    println!("{:<26} {:<6} NAME", "TOGGLE", "STATE");
    for toggle in toggles.list_toggles().await {
        println!("{:<26} {:<6} {}", toggle.toggle_id, toggle.state.to_string(), toggle.name);
    }
}
