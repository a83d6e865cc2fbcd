//! Outbound events and the network collaborator that carries them

use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// An event ready for the network layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub message_id: String,
    pub dialog_request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_dialog_request_id: Option<String>,
    pub context: Value,
    pub payload: Value,
}

/// One chunk of binary data streamed after an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub namespace: String,
    pub name: String,
    pub version: String,
    /// Message id of the event this attachment belongs to
    pub parent_message_id: String,
    pub dialog_request_id: String,
    pub seq: u32,
    pub is_end: bool,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// What a capability wants to send
///
/// Ids are generated and the context is assembled unless supplied here.
#[derive(Debug, Clone, Default)]
pub struct EventRequest {
    pub name: String,
    pub payload: Value,
    pub dialog_request_id: Option<String>,
    pub referrer_dialog_request_id: Option<String>,
    pub context: Option<Value>,
}

impl EventRequest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Object(serde_json::Map::new()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_dialog_request_id(mut self, id: impl Into<String>) -> Self {
        self.dialog_request_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_referrer(mut self, id: impl Into<String>) -> Self {
        self.referrer_dialog_request_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Identifies a sent event; needed to stream attachments after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReceipt {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub message_id: String,
    pub dialog_request_id: String,
}

/// Delivery outcome reported back by the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    pub message_id: String,
    pub dialog_request_id: String,
    pub success: bool,
    /// Transport status code, 0 when unknown
    pub code: i32,
}

/// Network collaborator accepting outbound events
pub trait Transport: Send + Sync {
    /// Queue an event for sending
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be queued
    fn send_event(&self, event: &Event) -> Result<()>;

    /// Queue an attachment chunk
    ///
    /// # Errors
    ///
    /// Returns error if the attachment cannot be queued
    fn send_attachment(&self, attachment: &Attachment) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_camel_case() {
        let event = Event {
            namespace: "ASR".to_string(),
            name: "Recognize".to_string(),
            version: "1.0".to_string(),
            message_id: "m".to_string(),
            dialog_request_id: "d".to_string(),
            referrer_dialog_request_id: None,
            context: Value::Null,
            payload: serde_json::json!({}),
        };

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["messageId"], "m");
        assert_eq!(json["dialogRequestId"], "d");
        assert!(json.get("referrerDialogRequestId").is_none());
    }

    #[test]
    fn request_defaults_to_empty_payload() {
        let request = EventRequest::new("Recognize");
        assert_eq!(request.payload, serde_json::json!({}));
        assert!(request.context.is_none());
    }
}
