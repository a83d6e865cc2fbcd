//! Multi-turn window tracking
//!
//! A single requester may own the multi-turn window at a time. Capabilities
//! open it when a response expects a follow-up utterance and close it once
//! the dialog ends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

/// Interaction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionMode {
    #[default]
    None,
    MultiTurn,
}

impl InteractionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::MultiTurn => "MULTI_TURN",
        }
    }
}

impl std::fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receives interaction-control notifications
pub trait InteractionControlListener: Send + Sync {
    /// The multi-turn window opened (`true`) or closed (`false`)
    fn on_mode_changed(&self, is_multi_turn: bool);

    /// The latest response implies a follow-up is coming
    fn on_has_multi_turn(&self) {}
}

#[derive(Default)]
struct InteractionState {
    mode: InteractionMode,
    holder: Option<String>,
    listeners: Vec<Arc<dyn InteractionControlListener>>,
}

/// Tracks the process-wide multi-turn window
#[derive(Clone, Default)]
pub struct InteractionControlManager {
    state: Arc<Mutex<InteractionState>>,
}

impl InteractionControlManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InteractionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener; duplicates are ignored
    pub fn add_listener(&self, listener: Arc<dyn InteractionControlListener>) {
        let mut state = self.lock();
        if !state.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            state.listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn InteractionControlListener>) {
        self.lock().listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Open the multi-turn window for `requester`
    ///
    /// Starting again with the current holder is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a mode other than multi-turn or
    /// an empty requester, and [`Error::InteractionBusy`] if another requester
    /// holds the window
    pub fn start(&self, mode: InteractionMode, requester: &str) -> Result<()> {
        if mode != InteractionMode::MultiTurn {
            return Err(Error::InvalidArgument(format!(
                "cannot start interaction mode {mode}"
            )));
        }
        if requester.is_empty() {
            return Err(Error::InvalidArgument("empty interaction requester".to_string()));
        }

        let listeners = {
            let mut state = self.lock();
            match state.holder.as_deref() {
                Some(holder) if holder == requester => return Ok(()),
                Some(holder) => {
                    tracing::warn!(requester, holder, "multi-turn window already held");
                    return Err(Error::InteractionBusy(holder.to_string()));
                }
                None => {}
            }
            state.holder = Some(requester.to_string());
            state.mode = InteractionMode::MultiTurn;
            state.listeners.clone()
        };

        tracing::debug!(requester, "multi-turn started");
        for listener in listeners {
            listener.on_mode_changed(true);
        }
        Ok(())
    }

    /// Close the multi-turn window if `requester` holds it
    ///
    /// Returns whether the window was closed.
    pub fn finish(&self, mode: InteractionMode, requester: &str) -> bool {
        let listeners = {
            let mut state = self.lock();
            if mode != state.mode || state.holder.as_deref() != Some(requester) {
                tracing::debug!(requester, "finish ignored, not the multi-turn holder");
                return false;
            }
            state.holder = None;
            state.mode = InteractionMode::None;
            state.listeners.clone()
        };

        tracing::debug!(requester, "multi-turn finished");
        for listener in listeners {
            listener.on_mode_changed(false);
        }
        true
    }

    /// Announce that a follow-up turn is expected
    pub fn notify_has_multi_turn(&self) {
        let listeners = self.lock().listeners.clone();
        for listener in listeners {
            listener.on_has_multi_turn();
        }
    }

    #[must_use]
    pub fn is_multi_turn_active(&self) -> bool {
        self.lock().mode == InteractionMode::MultiTurn
    }

    #[must_use]
    pub fn mode(&self) -> InteractionMode {
        self.lock().mode
    }

    /// Current holder of the multi-turn window
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.lock().holder.clone()
    }

    /// Force the mode back to none
    pub fn clear(&self) {
        let listeners = {
            let mut state = self.lock();
            state.mode = InteractionMode::None;
            state.holder.take().map(|_| state.listeners.clone())
        };

        for listener in listeners.into_iter().flatten() {
            listener.on_mode_changed(false);
        }
    }
}

impl std::fmt::Debug for InteractionControlManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InteractionControlManager")
            .field("mode", &state.mode)
            .field("holder", &state.holder)
            .finish_non_exhaustive()
    }
}
