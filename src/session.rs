//! Dialog session tracking
//!
//! A session binds a dialog request id to the server session id and the play
//! service that owns it. Capabilities keep a dialog alive with
//! [`SessionManager::activate`]/[`SessionManager::deactivate`], which are
//! reference counted because several capabilities may render the same dialog.
//! A session is ACTIVE while its dialog is activated and the session has been
//! set; at most one ACTIVE session exists per play service id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Value, json};

use crate::{Error, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    #[default]
    Inactive,
}

/// Server session bound to one dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(rename = "playServiceId")]
    pub ps_id: String,
    pub state: SessionState,
}

/// Receives session activation changes
pub trait SessionManagerListener: Send + Sync {
    fn activated(&self, dialog_id: &str, session: &Session);
    fn deactivated(&self, dialog_id: &str);
}

enum Notice {
    Activated(String, Session),
    Deactivated(String),
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, Session>,
    activations: HashMap<String, usize>,
    /// Dialogs with an ACTIVE session, in activation order
    active: Vec<String>,
    listeners: Vec<Arc<dyn SessionManagerListener>>,
}

impl SessionTable {
    fn make_active(&mut self, dialog_id: &str, notices: &mut Vec<Notice>) {
        let Some(session) = self.sessions.get_mut(dialog_id) else {
            return;
        };
        session.state = SessionState::Active;
        let session = session.clone();

        // Keep the play service id unique among active sessions
        let superseded: Vec<String> = self
            .active
            .iter()
            .filter(|d| {
                d.as_str() != dialog_id
                    && self.sessions.get(*d).is_some_and(|s| s.ps_id == session.ps_id)
            })
            .cloned()
            .collect();
        for old in superseded {
            self.active.retain(|d| d != &old);
            self.sessions.remove(&old);
            tracing::debug!(dialog_id = %old, ps_id = %session.ps_id, "session superseded");
            notices.push(Notice::Deactivated(old));
        }

        self.active.push(dialog_id.to_string());
        tracing::debug!(dialog_id, session_id = %session.session_id, "session activated");
        notices.push(Notice::Activated(dialog_id.to_string(), session));
    }
}

/// Tracks sessions per dialog
#[derive(Clone, Default)]
pub struct SessionManager {
    table: Arc<Mutex<SessionTable>>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self.lock().listeners.clone();
        for notice in &notices {
            for listener in &listeners {
                match notice {
                    Notice::Activated(dialog_id, session) => listener.activated(dialog_id, session),
                    Notice::Deactivated(dialog_id) => listener.deactivated(dialog_id),
                }
            }
        }
    }

    /// Register a listener; duplicates are ignored
    pub fn add_listener(&self, listener: Arc<dyn SessionManagerListener>) {
        let mut table = self.lock();
        if !table.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            table.listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionManagerListener>) {
        self.lock().listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Record the session for a dialog
    ///
    /// The first session set for a dialog wins. If the dialog is already
    /// activated the session becomes ACTIVE immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if any field is empty
    pub fn set(&self, dialog_id: &str, session_id: &str, ps_id: &str) -> Result<()> {
        if dialog_id.is_empty() || session_id.is_empty() || ps_id.is_empty() {
            return Err(Error::InvalidArgument(
                "session requires dialog id, session id and play service id".to_string(),
            ));
        }

        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            if table.sessions.contains_key(dialog_id) {
                tracing::warn!(dialog_id, "session already set for dialog");
                return Ok(());
            }
            table.sessions.insert(
                dialog_id.to_string(),
                Session {
                    session_id: session_id.to_string(),
                    ps_id: ps_id.to_string(),
                    state: SessionState::Inactive,
                },
            );
            if table.activations.get(dialog_id).is_some_and(|c| *c > 0) {
                table.make_active(dialog_id, &mut notices);
            }
        }
        self.notify(notices);
        Ok(())
    }

    /// Keep a dialog alive
    pub fn activate(&self, dialog_id: &str) {
        if dialog_id.is_empty() {
            tracing::warn!("activate ignored, empty dialog id");
            return;
        }

        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            let count = table.activations.entry(dialog_id.to_string()).or_insert(0);
            *count += 1;
            let first = *count == 1;
            let inactive = table
                .sessions
                .get(dialog_id)
                .is_some_and(|s| s.state == SessionState::Inactive);
            if first && inactive {
                table.make_active(dialog_id, &mut notices);
            }
        }
        self.notify(notices);
    }

    /// Release one activation of a dialog
    ///
    /// When the last activation is released the session is removed. Extra
    /// calls are no-ops.
    pub fn deactivate(&self, dialog_id: &str) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock();
            let Some(count) = table.activations.get_mut(dialog_id) else {
                return;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                return;
            }
            table.activations.remove(dialog_id);
            table.active.retain(|d| d != dialog_id);
            let was_active = table
                .sessions
                .remove(dialog_id)
                .is_some_and(|s| s.state == SessionState::Active);
            if was_active {
                tracing::debug!(dialog_id, "session deactivated");
                notices.push(Notice::Deactivated(dialog_id.to_string()));
            }
        }
        self.notify(notices);
    }

    /// Session recorded for a dialog
    #[must_use]
    pub fn session(&self, dialog_id: &str) -> Option<Session> {
        self.lock().sessions.get(dialog_id).cloned()
    }

    /// Number of ACTIVE sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Outstanding activations of a dialog
    #[must_use]
    pub fn activation_count(&self, dialog_id: &str) -> usize {
        self.lock().activations.get(dialog_id).copied().unwrap_or(0)
    }

    /// Active sessions as `[{"sessionId", "playServiceId"}]` in activation order
    #[must_use]
    pub fn get_active_session_info(&self) -> Value {
        let table = self.lock();
        let items: Vec<Value> = table
            .active
            .iter()
            .filter_map(|d| table.sessions.get(d))
            .map(|s| json!({ "sessionId": s.session_id, "playServiceId": s.ps_id }))
            .collect();
        Value::Array(items)
    }

    /// Remove every session, notifying deactivation for each ACTIVE one
    pub fn clear(&self) {
        let notices: Vec<Notice> = {
            let mut table = self.lock();
            let active = std::mem::take(&mut table.active);
            table.sessions.clear();
            table.activations.clear();
            active.into_iter().map(Notice::Deactivated).collect()
        };
        self.notify(notices);
    }

    /// Drop all state silently; listeners are kept
    pub fn reset(&self) {
        let mut table = self.lock();
        table.sessions.clear();
        table.activations.clear();
        table.active.clear();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("SessionManager")
            .field("sessions", &table.sessions)
            .field("active", &table.active)
            .finish_non_exhaustive()
    }
}
