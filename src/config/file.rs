//! TOML configuration file loading
//!
//! Supports `~/.config/voice-orchestrator/config.toml` as a persistent config
//! source. All fields are optional: the file is a partial overlay on top of
//! defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct OrchestratorConfigFile {
    /// Focus arbitration
    #[serde(default)]
    pub focus: FocusFileConfig,

    /// Play-sync release timers and participants
    #[serde(default)]
    pub play_sync: PlaySyncFileConfig,

    /// Directive sequencer
    #[serde(default)]
    pub sequencer: SequencerFileConfig,

    /// Outbound context snapshot
    #[serde(default)]
    pub context: ContextFileConfig,
}

/// Focus configuration
#[derive(Debug, Default, Deserialize)]
pub struct FocusFileConfig {
    /// "deny" or "background"
    pub reject_policy: Option<String>,

    /// Focus type to priority; overrides or extends the built-in table
    pub priorities: Option<BTreeMap<String, u32>>,
}

/// Play-sync configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaySyncFileConfig {
    /// Delay for a normal release, in seconds
    pub default_hold_secs: Option<u64>,

    /// Delay for a deferred release, in seconds
    pub long_hold_secs: Option<u64>,

    /// Capability namespaces that take part in play-sync
    pub sync_capabilities: Option<Vec<String>>,
}

/// Directive sequencer configuration
#[derive(Debug, Default, Deserialize)]
pub struct SequencerFileConfig {
    /// Watchdog for dispatched directives, in seconds; 0 disables it
    pub directive_timeout_secs: Option<u64>,
}

/// Context snapshot configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    pub wakeup_word: Option<String>,
    pub os: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `OrchestratorConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> OrchestratorConfigFile {
    let Some(path) = config_file_path() else {
        return OrchestratorConfigFile::default();
    };

    if !path.exists() {
        return OrchestratorConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            OrchestratorConfigFile::default()
        }
    }
}

/// Read and parse a config file, propagating failures
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<OrchestratorConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/voice-orchestrator/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-orchestrator").join("config.toml"))
}
