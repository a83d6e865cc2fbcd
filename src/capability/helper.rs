//! Handle giving capabilities access to the managers and the network

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::registry::WeakRegistry;
use super::{Attachment, Event, EventReceipt, EventRequest, Transport};
use crate::directive::DirectiveSequencer;
use crate::focus::FocusManager;
use crate::interaction::InteractionControlManager;
use crate::playsync::PlaySyncManager;
use crate::session::SessionManager;
use crate::{Error, Result};

/// Everything a capability may touch outside itself
///
/// Handed to each capability on initialization. Cheap to clone.
#[derive(Clone)]
pub struct CapabilityHelper {
    sequencer: DirectiveSequencer,
    focus: FocusManager,
    play_sync: PlaySyncManager,
    session: SessionManager,
    interaction: InteractionControlManager,
    registry: WeakRegistry,
    transport: Arc<dyn Transport>,
}

impl CapabilityHelper {
    #[must_use]
    pub(crate) fn new(
        sequencer: DirectiveSequencer,
        focus: FocusManager,
        play_sync: PlaySyncManager,
        session: SessionManager,
        interaction: InteractionControlManager,
        registry: WeakRegistry,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            sequencer,
            focus,
            play_sync,
            session,
            interaction,
            registry,
            transport,
        }
    }

    #[must_use]
    pub const fn sequencer(&self) -> &DirectiveSequencer {
        &self.sequencer
    }

    #[must_use]
    pub const fn focus_manager(&self) -> &FocusManager {
        &self.focus
    }

    #[must_use]
    pub const fn play_sync_manager(&self) -> &PlaySyncManager {
        &self.play_sync
    }

    #[must_use]
    pub const fn session_manager(&self) -> &SessionManager {
        &self.session
    }

    #[must_use]
    pub const fn interaction_control_manager(&self) -> &InteractionControlManager {
        &self.interaction
    }

    /// Finish a directive; see [`DirectiveSequencer::complete`]
    pub fn complete(&self, message_id: &str) -> bool {
        self.sequencer.complete(message_id)
    }

    /// Context snapshot for an event sent by `cname`
    #[must_use]
    pub fn make_context_info(&self, cname: &str) -> Value {
        self.registry
            .upgrade()
            .map_or(Value::Null, |r| r.make_context_info(cname))
    }

    #[must_use]
    pub fn make_all_context_info(&self) -> Value {
        self.registry
            .upgrade()
            .map_or(Value::Null, |r| r.make_all_context_info())
    }

    /// Read another capability's property
    #[must_use]
    pub fn property(&self, capability: &str, key: &str) -> Option<String> {
        self.registry.upgrade()?.property(capability, key)
    }

    #[must_use]
    pub fn properties(&self, capability: &str, key: &str) -> Vec<String> {
        self.registry
            .upgrade()
            .map(|r| r.properties(capability, key))
            .unwrap_or_default()
    }

    pub fn send_command(&self, from: &str, to: &str, command: &str, param: &str) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| r.send_command(from, to, command, param))
    }

    pub fn send_command_all(&self, command: &str, param: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.send_command_all(command, param);
        }
    }

    /// Send an event on behalf of capability `cname`
    ///
    /// Generates the message id, and the dialog request id unless the request
    /// carries one. The event is tracked until the network reports its
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the orchestrator is gone, or the
    /// transport error if the event could not be queued
    pub fn send_event(&self, cname: &str, request: EventRequest) -> Result<EventReceipt> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::NotFound("capability registry".to_string()))?;
        let version = registry
            .find(cname)
            .map_or_else(|| "1.0".to_string(), |c| c.version().to_string());

        let message_id = Uuid::new_v4().to_string();
        let dialog_request_id = request
            .dialog_request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = request
            .context
            .unwrap_or_else(|| registry.make_context_info(cname));

        let event = Event {
            namespace: cname.to_string(),
            name: request.name,
            version,
            message_id,
            dialog_request_id,
            referrer_dialog_request_id: request.referrer_dialog_request_id,
            context,
            payload: request.payload,
        };

        registry.request_event_result(cname, &event.message_id, &event.dialog_request_id);
        if let Err(e) = self.transport.send_event(&event) {
            registry.forget_event(&event.message_id);
            tracing::warn!(
                namespace = %event.namespace,
                name = %event.name,
                error = %e,
                "event not sent"
            );
            return Err(e);
        }
        tracing::debug!(
            namespace = %event.namespace,
            name = %event.name,
            message_id = %event.message_id,
            dialog_request_id = %event.dialog_request_id,
            "event sent"
        );

        Ok(EventReceipt {
            namespace: event.namespace,
            name: event.name,
            version: event.version,
            message_id: event.message_id,
            dialog_request_id: event.dialog_request_id,
        })
    }

    /// Stream one attachment chunk after an event
    ///
    /// # Errors
    ///
    /// Returns the transport error if the chunk could not be queued
    pub fn send_attachment_event(
        &self,
        receipt: &EventReceipt,
        seq: u32,
        is_end: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        let attachment = Attachment {
            namespace: receipt.namespace.clone(),
            name: receipt.name.clone(),
            version: receipt.version.clone(),
            parent_message_id: receipt.message_id.clone(),
            dialog_request_id: receipt.dialog_request_id.clone(),
            seq,
            is_end,
            data,
        };
        self.transport.send_attachment(&attachment)
    }
}

impl std::fmt::Debug for CapabilityHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityHelper").finish_non_exhaustive()
    }
}
