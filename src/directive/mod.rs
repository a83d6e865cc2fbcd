//! Inbound directives and their blocking policies
//!
//! A directive is a command from the cloud service addressed to one
//! capability namespace. Directives arrive in batches (a response); every
//! directive carries the `Namespace.Name` list of its response as `groups`,
//! which downstream managers use to decide play-stack layer and sync
//! participants.

mod sequencer;

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::Result;

pub use sequencer::DirectiveSequencer;

/// Media a directive occupies while it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMedium {
    Audio,
    Visual,
    /// Never blocks and is never blocked
    #[default]
    None,
    /// Audio and visual together
    Any,
}

impl BlockingMedium {
    const AUDIO: u8 = 0b01;
    const VISUAL: u8 = 0b10;

    pub(crate) const fn mask(self) -> u8 {
        match self {
            Self::Audio => Self::AUDIO,
            Self::Visual => Self::VISUAL,
            Self::None => 0,
            Self::Any => Self::AUDIO | Self::VISUAL,
        }
    }

    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AUDIO" => Some(Self::Audio),
            "VISUAL" => Some(Self::Visual),
            "NONE" => Some(Self::None),
            "ANY" => Some(Self::Any),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Visual => "VISUAL",
            Self::None => "NONE",
            Self::Any => "ANY",
        }
    }
}

impl std::fmt::Display for BlockingMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blocking behavior registered per directive type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockingPolicy {
    pub medium: BlockingMedium,
    /// Must finish before another directive on the same medium starts
    pub is_blocking: bool,
}

impl BlockingPolicy {
    #[must_use]
    pub const fn new(medium: BlockingMedium, is_blocking: bool) -> Self {
        Self {
            medium,
            is_blocking,
        }
    }
}

/// Where a tracked directive sits in the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveStatus {
    /// Waiting for its medium
    Queued,
    /// Dispatched and not yet completed
    Active,
}

/// Receives directives for one namespace
pub trait DirectiveListener: Send + Sync {
    /// Veto point before handling; returning `true` consumes the directive
    fn on_pre_handle_directive(&self, _directive: &Arc<Directive>) -> bool {
        false
    }

    /// Handle the directive; the handler must eventually complete it
    ///
    /// # Errors
    ///
    /// An error force-completes the directive
    fn on_handle_directive(&self, directive: &Arc<Directive>) -> Result<()>;

    /// The directive was cancelled before completing
    fn on_cancel_directive(&self, _directive: &Arc<Directive>) {}

    /// The directive completed and may be destroyed
    fn on_complete_directive(&self, _directive: &Arc<Directive>) {}
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A command from the cloud service
#[derive(Debug)]
pub struct Directive {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub message_id: String,
    pub dialog_request_id: String,
    pub referrer_dialog_request_id: Option<String>,
    pub payload: Value,
    /// `Namespace.Name` of every directive in the same response
    pub groups: Vec<String>,
    pub received_at: DateTime<Utc>,
    policy: OnceLock<BlockingPolicy>,
    active: AtomicBool,
}

impl Directive {
    /// Create a directive whose group is only itself
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        message_id: impl Into<String>,
        dialog_request_id: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        let groups = vec![format!("{namespace}.{name}")];
        Self {
            namespace,
            name,
            version: default_version(),
            message_id: message_id.into(),
            dialog_request_id: dialog_request_id.into(),
            referrer_dialog_request_id: None,
            payload: Value::Null,
            groups,
            received_at: Utc::now(),
            policy: OnceLock::new(),
            active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer_dialog_request_id: impl Into<String>) -> Self {
        self.referrer_dialog_request_id = Some(referrer_dialog_request_id.into());
        self
    }

    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a single `{header, payload}` envelope
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is not valid JSON or misses a header field
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(json)?;
        Ok(envelope.into_directive())
    }

    /// Parse a `{"directives": [...]}` response, filling in `groups`
    ///
    /// # Errors
    ///
    /// Returns error if the response is not valid JSON or an envelope misses
    /// a header field
    pub fn parse_response(json: &str) -> Result<Vec<Self>> {
        let response: Response = serde_json::from_str(json)?;
        let groups: Vec<String> = response
            .directives
            .iter()
            .map(|e| format!("{}.{}", e.header.namespace, e.header.name))
            .collect();
        Ok(response
            .directives
            .into_iter()
            .map(|e| e.into_directive().with_groups(groups.clone()))
            .collect())
    }

    /// `Namespace.Name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Namespaces of the response groups
    pub fn group_namespaces(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .filter_map(|g| g.split('.').next())
            .filter(|ns| !ns.is_empty())
    }

    /// Whether the response contains `Namespace.Name`
    #[must_use]
    pub fn has_group(&self, full_name: &str) -> bool {
        self.groups.iter().any(|g| g == full_name)
    }

    /// Blocking policy assigned when the directive was accepted
    #[must_use]
    pub fn blocking_policy(&self) -> BlockingPolicy {
        self.policy.get().copied().unwrap_or_default()
    }

    pub(crate) fn assign_policy(&self, policy: BlockingPolicy) {
        let _ = self.policy.set(policy);
    }

    /// False once the directive is cancelled
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    namespace: String,
    name: String,
    message_id: String,
    dialog_request_id: String,
    #[serde(default)]
    referrer_dialog_request_id: Option<String>,
    #[serde(default = "default_version")]
    version: String,
}

#[derive(Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    fn into_directive(self) -> Directive {
        let h = self.header;
        let mut directive = Directive::new(h.namespace, h.name, h.message_id, h.dialog_request_id)
            .with_version(h.version)
            .with_payload(self.payload);
        directive.referrer_dialog_request_id =
            h.referrer_dialog_request_id.filter(|r| !r.is_empty());
        directive
    }
}

#[derive(Deserialize)]
struct Response {
    directives: Vec<Envelope>,
}
