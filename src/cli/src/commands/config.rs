//! Configuration management commands.
//!
//! Stores CLI configuration in `~/.modelsync/config.toml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the stored configuration
    Show,

    /// Store the default API URL
    SetUrl {
        /// Base URL, e.g. http://localhost:8080
        url: String,
    },

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".modelsync").join("config.toml"))
}

/// Load the CLI configuration, returning defaults if the file does not exist.
fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// The stored API URL, if any.
pub fn load_api_url() -> Option<String> {
    load_config().ok().and_then(|cfg| cfg.api_url)
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let cfg = load_config()?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    output::print_detail("File", &config_path()?.display().to_string());
                    match &cfg.api_url {
                        Some(url) => output::print_detail("api-url", url),
                        None => output::print_info("No API URL stored."),
                    }
                }
                OutputFormat::Json => output::print_json(&cfg),
            }
        }

        ConfigCommands::SetUrl { url } => {
            reqwest::Url::parse(&url).with_context(|| format!("'{}' is not a valid URL", url))?;
            let mut cfg = load_config()?;
            cfg.api_url = Some(url.clone());
            save_config(&cfg)?;

            match format {
                OutputFormat::Table => output::print_success(&format!("api-url = {}", url)),
                OutputFormat::Json => output::print_json(&cfg),
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }

            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrips_through_toml() {
        let cfg = CliConfig {
            api_url: Some("http://example.test:9000".into()),
        };
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: CliConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.api_url.as_deref(), Some("http://example.test:9000"));
    }

    #[test]
    fn test_empty_config_file_is_default() {
        let cfg: CliConfig = toml::from_str("").unwrap();
        assert!(cfg.api_url.is_none());
    }
}
