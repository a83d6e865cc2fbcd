//! Capability contract
//!
//! A capability is one feature module (speech recognition, speech synthesis,
//! audio playback, display and so on). It owns one directive namespace,
//! declares the blocking policy of each directive it handles, and reaches
//! the managers and the network only through its [`CapabilityHelper`].
//!
//! Implementations usually embed a [`CapabilityCore`] for the bookkeeping
//! every capability shares.

mod helper;
mod registry;
mod transport;

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::{Map, Value};

use crate::directive::{BlockingPolicy, Directive};
use crate::{Error, Result};

pub use helper::CapabilityHelper;
pub use registry::{CMD_DIRECTIVE_DIALOG_ID, CMD_RECEIVE_DIRECTIVE_GROUP, CapabilityRegistry};
pub use transport::{Attachment, Event, EventReceipt, EventRequest, EventResult, Transport};

/// What a capability does when the host suspends it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendPolicy {
    /// Drop current work
    #[default]
    Stop,
    /// Keep current work and resume on restore
    Pause,
}

impl SuspendPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Pause => "pause",
        }
    }
}

impl std::fmt::Display for SuspendPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A feature module driven by directives
///
/// Every hook except identity and [`Capability::process_directive`] has a
/// no-op default.
pub trait Capability: Send + Sync {
    /// Directive namespace, unique per orchestrator
    fn name(&self) -> &str;

    /// Interface version; directives with another major version are dropped
    fn version(&self) -> &str;

    /// Blocking policy per directive name
    fn blocking_policies(&self) -> Vec<(String, BlockingPolicy)> {
        Vec::new()
    }

    /// Called once before the first directive
    ///
    /// # Errors
    ///
    /// Returns error if the capability cannot start
    fn initialize(&self, _helper: CapabilityHelper) -> Result<()> {
        Ok(())
    }

    fn de_initialize(&self) {}

    fn suspend_policy(&self) -> SuspendPolicy {
        SuspendPolicy::Stop
    }

    fn suspend(&self) {}

    fn restore(&self) {}

    /// Runs before the directive is queued
    fn preprocess_directive(&self, _directive: &Arc<Directive>) {}

    /// Handle a dispatched directive; the capability must later complete it
    ///
    /// # Errors
    ///
    /// An error makes the sequencer complete the directive at once
    fn process_directive(&self, directive: &Arc<Directive>) -> Result<()>;

    fn cancel_directive(&self, _directive: &Arc<Directive>) {}

    /// The directive is finished and will not be referenced again
    fn destroy_directive(&self, _directive: &Arc<Directive>) {}

    /// Full context, sent with this capability's own events
    fn context_info(&self) -> Option<Value> {
        None
    }

    /// Extend the compact context sent with other capabilities' events
    fn update_compact_context(&self, _ctx: &mut Map<String, Value>) {}

    fn property(&self, _key: &str) -> Option<String> {
        None
    }

    fn properties(&self, _key: &str) -> Vec<String> {
        Vec::new()
    }

    /// Command sent to this capability by another one
    fn receive_command(&self, _from: &str, _command: &str, _param: &str) -> bool {
        false
    }

    /// Command broadcast to every capability
    fn receive_command_all(&self, _command: &str, _param: &str) {}

    fn notify_event_result(&self, _result: &EventResult) {}

    fn notify_event_response(&self, _message_id: &str, _data: Option<&Value>, _success: bool) {}
}

#[derive(Default)]
struct CoreState {
    directive: Option<Arc<Directive>>,
    referrer_dialog_request_id: Option<String>,
    suspend_policy: SuspendPolicy,
    suspended: bool,
}

/// Shared bookkeeping for capability implementations
///
/// Tracks the directive being handled and the dialog it belongs to, so
/// events raised while handling it chain back to that dialog.
pub struct CapabilityCore {
    name: String,
    version: String,
    helper: OnceLock<CapabilityHelper>,
    state: Mutex<CoreState>,
}

impl CapabilityCore {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            helper: OnceLock::new(),
            state: Mutex::new(CoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Store the helper; only the first call has an effect
    pub fn attach(&self, helper: CapabilityHelper) -> bool {
        self.helper.set(helper).is_ok()
    }

    #[must_use]
    pub fn helper(&self) -> Option<&CapabilityHelper> {
        self.helper.get()
    }

    fn require_helper(&self) -> Result<&CapabilityHelper> {
        self.helper
            .get()
            .ok_or_else(|| Error::Capability(format!("{} not initialized", self.name)))
    }

    /// Make `directive` current
    ///
    /// Its referrer dialog id, or its own dialog id, becomes the referrer of
    /// events sent from now on.
    pub fn begin_directive(&self, directive: &Arc<Directive>) {
        let mut state = self.lock();
        state.referrer_dialog_request_id = Some(
            directive
                .referrer_dialog_request_id
                .clone()
                .unwrap_or_else(|| directive.dialog_request_id.clone()),
        );
        state.directive = Some(Arc::clone(directive));
    }

    #[must_use]
    pub fn current_directive(&self) -> Option<Arc<Directive>> {
        self.lock().directive.clone()
    }

    #[must_use]
    pub fn referrer_dialog_request_id(&self) -> Option<String> {
        self.lock().referrer_dialog_request_id.clone()
    }

    /// Complete the current directive in the sequencer
    ///
    /// Returns `false` if there is none or it was already finished.
    pub fn finish_directive(&self) -> bool {
        let Some(directive) = self.lock().directive.take() else {
            return false;
        };
        self.helper
            .get()
            .is_some_and(|h| h.complete(&directive.message_id))
    }

    /// Forget the current directive if it is `directive`
    pub fn drop_directive(&self, directive: &Directive) {
        let mut state = self.lock();
        if state
            .directive
            .as_ref()
            .is_some_and(|d| d.message_id == directive.message_id)
        {
            state.directive = None;
        }
    }

    /// Send an event, chaining the current referrer dialog id unless the
    /// request names one
    ///
    /// # Errors
    ///
    /// Returns error if the capability is not initialized or the transport
    /// rejects the event
    pub fn send_event(&self, mut request: EventRequest) -> Result<EventReceipt> {
        let helper = self.require_helper()?;
        if request.referrer_dialog_request_id.is_none() {
            request.referrer_dialog_request_id = self.referrer_dialog_request_id();
        }
        helper.send_event(&self.name, request)
    }

    /// # Errors
    ///
    /// Returns error if the capability is not initialized or the transport
    /// rejects the chunk
    pub fn send_attachment_event(
        &self,
        receipt: &EventReceipt,
        seq: u32,
        is_end: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        self.require_helper()?
            .send_attachment_event(receipt, seq, is_end, data)
    }

    #[must_use]
    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.lock().suspend_policy
    }

    pub fn set_suspend_policy(&self, policy: SuspendPolicy) {
        self.lock().suspend_policy = policy;
    }

    /// Record a suspend or restore; returns `false` if nothing changed
    pub fn set_suspended(&self, suspended: bool) -> bool {
        let mut state = self.lock();
        let changed = state.suspended != suspended;
        state.suspended = suspended;
        changed
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }
}

impl std::fmt::Debug for CapabilityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCore")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("initialized", &self.helper.get().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referrer_prefers_directive_referrer() {
        let core = CapabilityCore::new("TTS", "1.0");
        let plain = Arc::new(Directive::new("TTS", "Speak", "m1", "dlg-1"));
        let chained = Arc::new(Directive::new("TTS", "Speak", "m2", "dlg-2").with_referrer("ref"));

        core.begin_directive(&plain);
        assert_eq!(core.referrer_dialog_request_id().as_deref(), Some("dlg-1"));

        core.begin_directive(&chained);
        assert_eq!(core.referrer_dialog_request_id().as_deref(), Some("ref"));
        assert_eq!(core.current_directive().unwrap().message_id, "m2");
    }

    #[test]
    fn uninitialized_core_cannot_send() {
        let core = CapabilityCore::new("ASR", "1.0");

        let err = core.send_event(EventRequest::new("Recognize")).unwrap_err();

        assert!(matches!(err, Error::Capability(_)));
        assert!(!core.finish_directive());
    }

    #[test]
    fn drop_directive_only_clears_matching() {
        let core = CapabilityCore::new("TTS", "1.0");
        let d1 = Arc::new(Directive::new("TTS", "Speak", "m1", "dlg"));
        let d2 = Directive::new("TTS", "Speak", "m2", "dlg");
        core.begin_directive(&d1);

        core.drop_directive(&d2);
        assert!(core.current_directive().is_some());
        core.drop_directive(&d1);
        assert!(core.current_directive().is_none());
    }

    #[test]
    fn suspend_state_reports_changes() {
        let core = CapabilityCore::new("AudioPlayer", "1.0");
        core.set_suspend_policy(SuspendPolicy::Pause);

        assert!(core.set_suspended(true));
        assert!(!core.set_suspended(true));
        assert!(core.is_suspended());
        assert_eq!(core.suspend_policy(), SuspendPolicy::Pause);
    }
}
