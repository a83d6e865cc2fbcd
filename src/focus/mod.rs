//! Priority-based arbitration of exclusive device resources
//!
//! Requesters ask for focus on a resource *type* (call, speech input, media
//! playback, ...). Each type has a static priority where a lower number wins.
//! Exactly one resource holds the foreground at a time; the rest run in the
//! background or are denied.

mod manager;

pub use manager::FocusManager;

/// Well-known focus types and their default priorities
pub mod focus_type {
    pub const CALL: &str = "Call";
    pub const ASR_USER: &str = "ASRUser";
    pub const INFO: &str = "Info";
    pub const ALERTS: &str = "Alerts";
    pub const MEDIA: &str = "Media";
    pub const ASR_DM: &str = "ASRDM";
    pub const ASR_BEEP: &str = "ASRBeep";
    pub const SOUND: &str = "Sound";
    pub const DUMMY: &str = "Dummy";
}

/// Focus state reported to resource listeners and observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusState {
    /// Resource owns the device
    Foreground,
    /// Resource is alive but yielded to a higher-priority requester
    Background,
    /// Resource holds no focus
    #[default]
    None,
}

impl FocusState {
    /// Parse from string representation (case-insensitive)
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "FOREGROUND" => Some(Self::Foreground),
            "BACKGROUND" => Some(Self::Background),
            "NONE" => Some(Self::None),
            _ => None,
        }
    }

    /// Wire/log representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "FOREGROUND",
            Self::Background => "BACKGROUND",
            Self::None => "NONE",
        }
    }
}

impl std::fmt::Display for FocusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a focus request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOutcome {
    /// Requester now owns the foreground
    Foreground,
    /// Requester was recorded in the background
    Background,
    /// Requester was not recorded
    Denied,
}

/// Answer of an incumbent asked to give up the foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StealDecision {
    #[default]
    Allow,
    Reject,
}

/// What happens to a requester whose steal attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Requester is denied and not recorded
    #[default]
    Deny,
    /// Requester is recorded in the background
    Background,
}

impl RejectPolicy {
    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deny" => Some(Self::Deny),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

impl std::fmt::Display for RejectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deny => write!(f, "deny"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Priority entry for one focus type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusConfiguration {
    pub focus_type: String,
    /// Lower value means higher priority
    pub priority: u32,
}

impl FocusConfiguration {
    #[must_use]
    pub fn new(focus_type: impl Into<String>, priority: u32) -> Self {
        Self {
            focus_type: focus_type.into(),
            priority,
        }
    }
}

/// Built-in priority table
#[must_use]
pub fn default_configurations() -> Vec<FocusConfiguration> {
    [
        (focus_type::CALL, 100),
        (focus_type::ASR_USER, 100),
        (focus_type::INFO, 200),
        (focus_type::ALERTS, 200),
        (focus_type::MEDIA, 300),
        (focus_type::ASR_DM, 400),
        (focus_type::ASR_BEEP, 500),
        (focus_type::SOUND, 500),
        (focus_type::DUMMY, 600),
    ]
    .into_iter()
    .map(|(t, p)| FocusConfiguration::new(t, p))
    .collect()
}

/// Listener owned by a single focus resource
pub trait FocusResourceListener: Send + Sync {
    /// The resource's focus state changed
    fn on_focus_changed(&self, state: FocusState);

    /// A higher-priority requester wants the foreground
    fn on_steal_request(&self, _requester_type: &str, _requester_name: &str) -> StealDecision {
        StealDecision::Allow
    }

    /// Whether the resource survives demotion to the background
    fn can_run_in_background(&self) -> bool {
        true
    }
}

/// Global observer of every focus transition
pub trait FocusManagerObserver: Send + Sync {
    fn on_focus_changed(&self, configuration: &FocusConfiguration, state: FocusState, name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_state_round_trips_through_strings() {
        for state in [FocusState::Foreground, FocusState::Background, FocusState::None] {
            assert_eq!(FocusState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(FocusState::from_str("foreground"), Some(FocusState::Foreground));
        assert_eq!(FocusState::from_str("sideways"), None);
        assert_eq!(FocusState::Background.to_string(), "BACKGROUND");
    }

    #[test]
    fn default_table_puts_call_above_media() {
        let table = default_configurations();
        let priority = |t: &str| {
            table
                .iter()
                .find(|c| c.focus_type == t)
                .map(|c| c.priority)
                .unwrap()
        };

        assert!(priority(focus_type::CALL) < priority(focus_type::MEDIA));
        assert_eq!(priority(focus_type::CALL), priority(focus_type::ASR_USER));
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn reject_policy_parses() {
        assert_eq!(RejectPolicy::from_str("Background"), Some(RejectPolicy::Background));
        assert_eq!(RejectPolicy::from_str("deny"), Some(RejectPolicy::Deny));
        assert_eq!(RejectPolicy::from_str("maybe"), None);
        assert_eq!(RejectPolicy::default(), RejectPolicy::Deny);
    }
}
