//! Configuration file management for convoy.
//!
//! Provides a TOML-based config file at `~/.config/convoy/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: DefaultsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Default output directory for runs.
    pub output_dir: Option<String>,
    /// Default cloud region.
    pub region: Option<String>,
    /// Default object-store bucket.
    pub bucket: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the convoy config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/convoy` or `~/.config/convoy`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("convoy");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("convoy")
}

/// Return the path to the convoy config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Defaults resolved from flags, environment, and the config file.
#[derive(Debug)]
pub struct ResolvedDefaults {
    pub output_dir: PathBuf,
    pub region: String,
    pub bucket: Option<String>,
}

impl ResolvedDefaults {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Output dir: flag > `CONVOY_OUTPUT_DIR` > file > `./outputs/convoy`
    /// - Region: flag > `CONVOY_REGION` > file > `eu-central-1`
    /// - Bucket: flag > `CONVOY_BUCKET` > file > none
    pub fn resolve(
        cli_output_dir: Option<&str>,
        cli_region: Option<&str>,
        cli_bucket: Option<&str>,
    ) -> Self {
        let file_config = load_config().ok();
        let file_defaults = file_config.map(|c| c.defaults).unwrap_or_default();

        let output_dir = cli_output_dir
            .map(str::to_owned)
            .or_else(|| std::env::var("CONVOY_OUTPUT_DIR").ok())
            .or(file_defaults.output_dir)
            .unwrap_or_else(|| "outputs/convoy".to_owned());

        let region = cli_region
            .map(str::to_owned)
            .or_else(|| std::env::var("CONVOY_REGION").ok())
            .or(file_defaults.region)
            .unwrap_or_else(|| "eu-central-1".to_owned());

        let bucket = cli_bucket
            .map(str::to_owned)
            .or_else(|| std::env::var("CONVOY_BUCKET").ok())
            .or(file_defaults.bucket);

        Self {
            output_dir: PathBuf::from(output_dir),
            region,
            bucket,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
