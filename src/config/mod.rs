//! Configuration for the voice orchestrator
//!
//! Values resolve as env > toml > default.

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::focus::{FocusConfiguration, RejectPolicy, default_configurations};
use crate::playsync::{PlayStackHoldTime, default_sync_capabilities};
use crate::{Error, Result};

use file::OrchestratorConfigFile;

/// Default directive watchdog
pub const DEFAULT_DIRECTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Focus priorities and steal-rejection policy
    pub focus: FocusConfig,

    /// Play-sync hold times and participating capabilities
    pub play_sync: PlaySyncConfig,

    /// Directive sequencer settings
    pub sequencer: SequencerConfig,

    /// Defaults for the outbound context snapshot
    pub context: ContextConfig,
}

/// Focus manager configuration
#[derive(Debug, Clone)]
pub struct FocusConfig {
    pub configurations: Vec<FocusConfiguration>,
    pub reject_policy: RejectPolicy,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            configurations: default_configurations(),
            reject_policy: RejectPolicy::default(),
        }
    }
}

/// Play-sync manager configuration
#[derive(Debug, Clone)]
pub struct PlaySyncConfig {
    pub hold_time: PlayStackHoldTime,
    pub sync_capabilities: Vec<String>,
}

impl Default for PlaySyncConfig {
    fn default() -> Self {
        Self {
            hold_time: PlayStackHoldTime::default(),
            sync_capabilities: default_sync_capabilities(),
        }
    }
}

/// Directive sequencer configuration
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Watchdog for dispatched directives; `None` disables it
    pub directive_timeout: Option<Duration>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            directive_timeout: Some(DEFAULT_DIRECTIVE_TIMEOUT),
        }
    }
}

/// Values reported in the `client` section of every context snapshot
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub wakeup_word: String,
    pub os: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            wakeup_word: "aria".to_string(),
            os: "Linux".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_file(fc)?.with_env()
    }

    /// Load configuration from an explicit file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or a value is invalid
    pub fn load_from(path: &Path) -> Result<Self> {
        let fc = file::read_config_file(path)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Self::from_file(fc)?.with_env()
    }

    /// Resolve a parsed config file over the defaults
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn from_file(fc: OrchestratorConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(policy) = fc.focus.reject_policy.as_deref() {
            config.focus.reject_policy = parse_reject_policy(policy)?;
        }
        if let Some(priorities) = fc.focus.priorities {
            for (focus_type, priority) in priorities {
                match config
                    .focus
                    .configurations
                    .iter_mut()
                    .find(|c| c.focus_type == focus_type)
                {
                    Some(existing) => existing.priority = priority,
                    None => config
                        .focus
                        .configurations
                        .push(FocusConfiguration::new(focus_type, priority)),
                }
            }
        }

        let hold = &mut config.play_sync.hold_time;
        if let Some(secs) = fc.play_sync.default_hold_secs {
            hold.default = Duration::from_secs(secs);
        }
        if let Some(secs) = fc.play_sync.long_hold_secs {
            hold.long = Duration::from_secs(secs);
        }
        if hold.long < hold.default {
            return Err(Error::Config(format!(
                "play_sync.long_hold_secs ({}) is shorter than default_hold_secs ({})",
                hold.long.as_secs(),
                hold.default.as_secs()
            )));
        }
        if let Some(caps) = fc.play_sync.sync_capabilities {
            config.play_sync.sync_capabilities = caps;
        }

        if let Some(secs) = fc.sequencer.directive_timeout_secs {
            config.sequencer.directive_timeout = timeout_from_secs(secs);
        }

        if let Some(word) = fc.context.wakeup_word {
            config.context.wakeup_word = word;
        }
        if let Some(os) = fc.context.os {
            config.context.os = os;
        }

        Ok(config)
    }

    fn with_env(mut self) -> Result<Self> {
        if let Some(secs) = std::env::var("ORCHESTRATOR_DIRECTIVE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.sequencer.directive_timeout = timeout_from_secs(secs);
        }
        if let Ok(policy) = std::env::var("ORCHESTRATOR_FOCUS_REJECT_POLICY") {
            self.focus.reject_policy = parse_reject_policy(&policy)?;
        }
        if let Ok(word) = std::env::var("ORCHESTRATOR_WAKEUP_WORD") {
            self.context.wakeup_word = word;
        }
        Ok(self)
    }
}

fn parse_reject_policy(s: &str) -> Result<RejectPolicy> {
    RejectPolicy::from_str(s)
        .ok_or_else(|| Error::Config(format!("unknown focus reject policy: {s}")))
}

const fn timeout_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}
