//! Switchboard CLI
//!
//! Commands:
//! - `switchboard run` - Start the control plane and run until interrupted
//! - `switchboard config` - Configuration management
//! - `switchboard toggles` - List the built-in feature toggles

pub mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Switchboard control plane
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author, version, about = "Control plane for multi-component runtimes")]
pub struct Cli {
    /// Directory holding default.toml and the per-environment overrides
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start every component and run until Ctrl+C or a halt request
    Run {
        /// Seconds between halt checks
        #[arg(long, default_value = "1")]
        halt_poll_secs: u64,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// List the built-in toggles and their initial states
    Toggles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_config_dir() {
        let cli = Cli::parse_from(["switchboard", "--config-dir", "/etc/sb", "run"]);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/sb"));
        assert!(matches!(cli.command, Commands::Run { halt_poll_secs: 1 }));
    }

    #[test]
    fn test_parse_config_show_section() {
        let cli = Cli::parse_from(["switchboard", "config", "show", "--section", "buffer"]);
        match cli.command {
            Commands::Config(config::ConfigCommands::Show { section }) => {
                assert_eq!(section.as_deref(), Some("buffer"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
