//! Cross-capability render/audio lifecycle synchronization
//!
//! A play-sync entry is keyed by play service id and shared by every
//! capability that renders part of one response (speech, screen, audio).
//! Entries move `None -> Prepared -> Synced -> Released`; a released entry is
//! gone, and preparing the same id again starts a fresh lifecycle.
//!
//! Entries sit on a play stack. Only a non-media layer may stack on top of a
//! media entry; any other new entry releases what is already there.

mod manager;

use std::time::Duration;

use serde_json::Value;

use crate::directive::Directive;

pub use manager::PlaySyncManager;

/// Group name marking a response that expects a follow-up utterance
pub const EXPECT_SPEECH_GROUP: &str = "ASR.ExpectSpeech";

/// Capabilities that take part in play-sync unless configured otherwise
#[must_use]
pub fn default_sync_capabilities() -> Vec<String> {
    ["TTS", "AudioPlayer", "Display"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Sync state of an entry or one of its participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaySyncState {
    #[default]
    None,
    Prepared,
    Synced,
    Released,
    /// Participant joined an entry that had already synced
    Appending,
}

impl PlaySyncState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Prepared => "Prepared",
            Self::Synced => "Synced",
            Self::Released => "Released",
            Self::Appending => "Appending",
        }
    }
}

impl std::fmt::Display for PlaySyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Play stack layer of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayStackLayer {
    #[default]
    None,
    Alert,
    Call,
    Info,
    Media,
}

impl PlayStackLayer {
    /// Derive the layer from the `Namespace.Name` groups of a response
    #[must_use]
    pub fn from_groups(groups: &[String]) -> Self {
        let has = |ns: &str| {
            groups
                .iter()
                .any(|g| g.split('.').next().is_some_and(|n| n == ns))
        };

        if groups.is_empty() {
            Self::None
        } else if has("PhoneCall") {
            Self::Call
        } else if has("Alerts") {
            Self::Alert
        } else if has("AudioPlayer") {
            Self::Media
        } else {
            Self::Info
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Alert => "Alert",
            Self::Call => "Call",
            Self::Info => "Info",
            Self::Media => "Media",
        }
    }
}

impl std::fmt::Display for PlayStackLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Release delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayStackHoldTime {
    /// Used by `release_sync`
    pub default: Duration,
    /// Used by `release_sync_later`
    pub long: Duration,
}

impl Default for PlayStackHoldTime {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(7),
            long: Duration::from_secs(600),
        }
    }
}

/// Receives play-sync notifications for one requester
pub trait PlaySyncListener: Send + Sync {
    /// State of the requester's participation changed
    fn on_sync_state(&self, ps_id: &str, state: PlaySyncState, extra: Option<&Value>);

    /// Extra data was replaced after syncing
    fn on_data_changed(&self, _ps_id: &str, _previous: Option<&Value>, _current: &Value) {}

    /// An entry was pushed onto the play stack
    fn on_stack_added(&self, _ps_id: &str) {}

    /// An entry left the play stack
    fn on_stack_removed(&self, _ps_id: &str) {}
}

/// Whether a directive's response expects a follow-up utterance
#[must_use]
pub fn expects_speech(directive: &Directive) -> bool {
    directive.groups.iter().any(|g| g == EXPECT_SPEECH_GROUP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn layer_from_groups() {
        assert_eq!(
            PlayStackLayer::from_groups(&groups(&["TTS.Speak", "AudioPlayer.Play"])),
            PlayStackLayer::Media
        );
        assert_eq!(
            PlayStackLayer::from_groups(&groups(&["TTS.Speak", "Display.FullText1"])),
            PlayStackLayer::Info
        );
        assert_eq!(
            PlayStackLayer::from_groups(&groups(&["Alerts.SetAlert", "TTS.Speak"])),
            PlayStackLayer::Alert
        );
        assert_eq!(
            PlayStackLayer::from_groups(&groups(&["PhoneCall.MakeCall"])),
            PlayStackLayer::Call
        );
        assert_eq!(PlayStackLayer::from_groups(&[]), PlayStackLayer::None);
    }

    #[test]
    fn default_hold_times() {
        let hold = PlayStackHoldTime::default();
        assert!(hold.default < hold.long);
        assert_eq!(hold.default.as_secs(), 7);
    }
}
