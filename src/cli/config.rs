//! Configuration management commands
//!
//! switchboard config show     - Show the effective configuration
//! switchboard config validate - Validate configuration

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use std::path::Path;

use crate::config::AppConfig;

/// Configuration-related commands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration as JSON
    Show {
        /// Configuration section to show (router, balancer, buffer, ...)
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Load and validate the configuration
    Validate,
}

impl ConfigCommands {
    pub fn run(self, config_dir: &Path) -> Result<()> {
        match self {
            Self::Show { section } => show_config(config_dir, section.as_deref()),
            Self::Validate => validate_config(config_dir),
        }
    }
}

fn load(config_dir: &Path) -> Result<AppConfig> {
    AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))
}

fn show_config(config_dir: &Path, section: Option<&str>) -> Result<()> {
    let config = load(config_dir)?;
    let value = serde_json::to_value(&config)?;
    let shown = match section {
        Some(name) => value
            .get(name)
            .cloned()
            .with_context(|| format!("unknown configuration section: {}", name))?,
        None => value,
    };
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

fn validate_config(config_dir: &Path) -> Result<()> {
    let config = load(config_dir)?;
    match config.validate() {
        Ok(()) => {
            println!("Configuration in {} is valid", config_dir.display());
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("  - {}", error);
            }
            bail!("{} configuration error(s)", errors.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_reports_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[balancer]\nstrategy = \"fastest\"\n",
        )
        .unwrap();

        let err = validate_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("1 configuration error"));
    }

    #[test]
    fn test_show_unknown_section_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(show_config(dir.path(), Some("nope")).is_err());
        assert!(show_config(dir.path(), Some("buffer")).is_ok());
    }
}
