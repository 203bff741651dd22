//! Configuration file management for kugutsu.
//!
//! Provides a TOML-based config file at `~/.config/kugutsu/config.toml`
//! and a resolution chain: CLI flag > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    pub base_branch: Option<String>,
    pub max_engineers: Option<usize>,
    pub max_turns: Option<u32>,
    pub worktree_base: Option<PathBuf>,
    pub use_remote: Option<bool>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the kugutsu config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/kugutsu` or
/// `~/.config/kugutsu`, ignoring the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("kugutsu");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("kugutsu")
}

/// Return the path to the kugutsu config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load the config file, or defaults when it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}
