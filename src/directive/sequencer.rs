//! Directive ordering, blocking and cancellation
//!
//! Media directives wait in one arrival-ordered queue. A directive leaves the
//! queue when no in-flight blocking directive occupies any of its media and
//! no earlier queued directive shares one of them. Dispatch runs through a
//! ready queue drained by a single caller at a time, so handlers may call back
//! into the sequencer (usually to complete) without recursing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use super::{BlockingMedium, BlockingPolicy, Directive, DirectiveListener, DirectiveStatus};
use crate::timer::{Timer, TimerId};
use crate::{Error, Result};

struct Tracked {
    directive: Arc<Directive>,
    policy: BlockingPolicy,
    status: DirectiveStatus,
    seq: u64,
    /// Handed to listeners
    dispatched: bool,
    watchdog: Option<TimerId>,
}

#[derive(Default)]
struct SequencerState {
    listeners: HashMap<String, Vec<Arc<dyn DirectiveListener>>>,
    policies: HashMap<(String, String), BlockingPolicy>,
    /// Every live directive by message id
    tracked: HashMap<String, Tracked>,
    /// Media directives waiting for their medium, arrival order
    pending: VecDeque<String>,
    /// Dispatched blocking directives occupying their media
    blocking: Vec<String>,
    /// Eligible directives not yet handed to listeners
    ready: VecDeque<String>,
    dispatching: bool,
    seq: u64,
    canceled_dialog_id: Option<String>,
}

impl SequencerState {
    fn listeners_for(&self, namespace: &str) -> Vec<Arc<dyn DirectiveListener>> {
        self.listeners.get(namespace).cloned().unwrap_or_default()
    }

    /// Move every eligible queued directive to the ready queue
    fn schedule(&mut self) {
        let mut blocked = self
            .blocking
            .iter()
            .filter_map(|id| self.tracked.get(id))
            .fold(0, |mask, t| mask | t.policy.medium.mask());

        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(id) = self.pending.pop_front() {
            let Some(tracked) = self.tracked.get_mut(&id) else {
                continue;
            };
            let mask = tracked.policy.medium.mask();
            if mask & blocked == 0 {
                tracked.status = DirectiveStatus::Active;
                if tracked.policy.is_blocking {
                    blocked |= mask;
                    self.blocking.push(id.clone());
                }
                self.ready.push_back(id);
            } else {
                // Later directives on the same medium keep arrival order
                blocked |= mask;
                waiting.push_back(id);
            }
        }
        self.pending = waiting;
    }

    /// Drop a directive from every queue
    fn untrack(&mut self, message_id: &str, timer: &dyn Timer) -> Option<Tracked> {
        let tracked = self.tracked.remove(message_id)?;
        if let Some(id) = tracked.watchdog {
            timer.cancel(id);
        }
        self.pending.retain(|id| id != message_id);
        self.ready.retain(|id| id != message_id);
        self.blocking.retain(|id| id != message_id);
        Some(tracked)
    }
}

struct Shared {
    state: Mutex<SequencerState>,
    timer: Arc<dyn Timer>,
    directive_timeout: Option<Duration>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let next = {
                let mut state = self.lock();
                let Some(id) = state.ready.pop_front() else {
                    state.dispatching = false;
                    break;
                };
                let watchdog = self.arm_watchdog(&id);
                let Some(tracked) = state.tracked.get_mut(&id) else {
                    if let Some(w) = watchdog {
                        self.timer.cancel(w);
                    }
                    continue;
                };
                tracked.watchdog = watchdog;
                tracked.dispatched = true;
                let directive = Arc::clone(&tracked.directive);
                let listeners = state.listeners_for(&directive.namespace);
                (directive, listeners)
            };
            self.dispatch(&next.0, &next.1);
        }
    }

    fn dispatch(self: &Arc<Self>, directive: &Arc<Directive>, listeners: &[Arc<dyn DirectiveListener>]) {
        tracing::debug!(
            namespace = %directive.namespace,
            name = %directive.name,
            message_id = %directive.message_id,
            "directive dispatched"
        );

        for listener in listeners {
            // Cancelled between leaving the ready queue and here
            if !directive.is_active() {
                tracing::debug!(message_id = %directive.message_id, "cancelled before handling");
                return;
            }
            if let Err(e) = listener.on_handle_directive(directive) {
                tracing::error!(
                    namespace = %directive.namespace,
                    name = %directive.name,
                    message_id = %directive.message_id,
                    error = %e,
                    "directive handler failed, completing"
                );
                self.complete(&directive.message_id);
                return;
            }
        }
    }

    fn arm_watchdog(self: &Arc<Self>, message_id: &str) -> Option<TimerId> {
        let timeout = self.directive_timeout?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = message_id.to_string();
        Some(self.timer.schedule(
            timeout,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_watchdog(&id);
                }
            }),
        ))
    }

    fn on_watchdog(self: &Arc<Self>, message_id: &str) {
        let stalled = {
            let state = self.lock();
            state
                .tracked
                .get(message_id)
                .filter(|t| t.status == DirectiveStatus::Active)
                .map(|t| Arc::clone(&t.directive))
        };
        if let Some(directive) = stalled {
            let elapsed = chrono::Utc::now() - directive.received_at;
            tracing::error!(
                namespace = %directive.namespace,
                name = %directive.name,
                message_id,
                elapsed_ms = elapsed.num_milliseconds(),
                "directive neither completed nor cancelled, forcing completion"
            );
            self.complete(message_id);
        }
    }

    fn complete(self: &Arc<Self>, message_id: &str) -> bool {
        let (directive, listeners) = {
            let mut state = self.lock();
            let Some(tracked) = state.untrack(message_id, self.timer.as_ref()) else {
                return false;
            };
            state.schedule();
            let listeners = state.listeners_for(&tracked.directive.namespace);
            (tracked.directive, listeners)
        };

        tracing::debug!(
            namespace = %directive.namespace,
            name = %directive.name,
            message_id,
            "directive completed"
        );
        for listener in &listeners {
            listener.on_complete_directive(&directive);
        }
        self.drain();
        true
    }

    fn cancel_where(
        self: &Arc<Self>,
        dialog_id: Option<&str>,
        predicate: impl Fn(&Tracked) -> bool,
    ) -> usize {
        let cancelled = {
            let mut state = self.lock();
            let mut matched: Vec<(u64, String)> = state
                .tracked
                .values()
                .filter(|t| predicate(*t))
                .map(|t| (t.seq, t.directive.message_id.clone()))
                .collect();
            matched.sort_unstable();

            let mut cancelled = Vec::with_capacity(matched.len());
            for (_, id) in matched {
                if let Some(tracked) = state.untrack(&id, self.timer.as_ref()) {
                    tracked.directive.set_active(false);
                    let listeners = state.listeners_for(&tracked.directive.namespace);
                    cancelled.push((tracked.directive, listeners));
                }
            }
            if let Some(dialog_id) = dialog_id {
                state.canceled_dialog_id = Some(dialog_id.to_string());
            }
            state.schedule();
            cancelled
        };

        for (directive, listeners) in &cancelled {
            tracing::debug!(
                namespace = %directive.namespace,
                name = %directive.name,
                message_id = %directive.message_id,
                "directive cancelled"
            );
            for listener in listeners {
                listener.on_cancel_directive(directive);
            }
        }
        self.drain();
        cancelled.len()
    }
}

/// Orders inbound directives and dispatches them to namespace listeners
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct DirectiveSequencer {
    inner: Arc<Shared>,
}

impl DirectiveSequencer {
    /// Create a sequencer; `directive_timeout` arms a watchdog per dispatched
    /// directive
    #[must_use]
    pub fn new(timer: Arc<dyn Timer>, directive_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(SequencerState::default()),
                timer,
                directive_timeout,
            }),
        }
    }

    /// Register a listener for a namespace; duplicates are ignored
    pub fn add_listener(&self, namespace: &str, listener: Arc<dyn DirectiveListener>) {
        let mut state = self.inner.lock();
        let list = state.listeners.entry(namespace.to_string()).or_default();
        if !list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            list.push(listener);
        }
    }

    pub fn remove_listener(&self, namespace: &str, listener: &Arc<dyn DirectiveListener>) {
        let mut state = self.inner.lock();
        if let Some(list) = state.listeners.get_mut(namespace) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
            if list.is_empty() {
                state.listeners.remove(namespace);
            }
        }
    }

    /// Register the blocking policy of a directive type
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyExists`] if the type already has a policy
    pub fn add_policy(&self, namespace: &str, name: &str, policy: BlockingPolicy) -> Result<()> {
        let mut state = self.inner.lock();
        let key = (namespace.to_string(), name.to_string());
        if state.policies.contains_key(&key) {
            return Err(Error::PolicyExists(format!("{namespace}.{name}")));
        }
        tracing::debug!(
            namespace,
            name,
            medium = %policy.medium,
            is_blocking = policy.is_blocking,
            "blocking policy registered"
        );
        state.policies.insert(key, policy);
        Ok(())
    }

    pub fn remove_policy(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .policies
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Policy of a directive type; unregistered types never block
    #[must_use]
    pub fn policy(&self, namespace: &str, name: &str) -> BlockingPolicy {
        self.inner
            .lock()
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Accept a directive
    ///
    /// Listeners get a pre-handle veto first; a consumed directive is not
    /// tracked. Otherwise the directive dispatches now if its medium is free
    /// (or it has none) and queues behind its medium if not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMessage`] if the message id is live and
    /// [`Error::UnknownNamespace`] if no listener handles the namespace
    pub fn add(&self, directive: impl Into<Arc<Directive>>) -> Result<()> {
        let directive: Arc<Directive> = directive.into();
        let listeners = {
            let state = self.inner.lock();
            if state.tracked.contains_key(&directive.message_id) {
                return Err(Error::DuplicateMessage(directive.message_id.clone()));
            }
            let listeners = state.listeners_for(&directive.namespace);
            if listeners.is_empty() {
                return Err(Error::UnknownNamespace(directive.namespace.clone()));
            }
            listeners
        };

        for listener in &listeners {
            if listener.on_pre_handle_directive(&directive) {
                tracing::debug!(
                    namespace = %directive.namespace,
                    name = %directive.name,
                    message_id = %directive.message_id,
                    "directive consumed before handling"
                );
                return Ok(());
            }
        }

        {
            let mut state = self.inner.lock();
            if state.tracked.contains_key(&directive.message_id) {
                return Err(Error::DuplicateMessage(directive.message_id.clone()));
            }
            let policy = state
                .policies
                .get(&(directive.namespace.clone(), directive.name.clone()))
                .copied()
                .unwrap_or_default();
            directive.assign_policy(policy);
            directive.set_active(true);

            state.seq += 1;
            let seq = state.seq;
            let id = directive.message_id.clone();
            let immediate = policy.medium == BlockingMedium::None;
            tracing::debug!(
                namespace = %directive.namespace,
                name = %directive.name,
                message_id = %id,
                medium = %policy.medium,
                is_blocking = policy.is_blocking,
                "directive accepted"
            );
            state.tracked.insert(
                id.clone(),
                Tracked {
                    directive,
                    policy,
                    status: if immediate {
                        DirectiveStatus::Active
                    } else {
                        DirectiveStatus::Queued
                    },
                    seq,
                    dispatched: false,
                    watchdog: None,
                },
            );
            if immediate {
                state.ready.push_back(id);
            } else {
                state.pending.push_back(id);
                state.schedule();
            }
        }

        self.inner.drain();
        Ok(())
    }

    /// Finish a directive and free its medium
    ///
    /// Returns `false` for unknown, completed or cancelled ids.
    pub fn complete(&self, message_id: &str) -> bool {
        self.inner.complete(message_id)
    }

    /// Cancel every live directive of a dialog
    ///
    /// Returns the number of directives cancelled.
    pub fn cancel(&self, dialog_request_id: &str) -> usize {
        self.inner.cancel_where(Some(dialog_request_id), |t| {
            t.directive.dialog_request_id == dialog_request_id
        })
    }

    /// Cancel the directives of a dialog that listeners have not seen yet
    ///
    /// The in-flight directive, if any, keeps running; used on barge-in.
    pub fn cancel_pending(&self, dialog_request_id: &str) -> usize {
        self.inner.cancel_where(Some(dialog_request_id), |t| {
            t.directive.dialog_request_id == dialog_request_id && !t.dispatched
        })
    }

    /// Cancel the live directives of a dialog whose `Namespace.Name` is listed
    pub fn cancel_groups(&self, dialog_request_id: &str, groups: &[&str]) -> usize {
        self.inner.cancel_where(None, |t| {
            t.directive.dialog_request_id == dialog_request_id
                && groups.iter().any(|g| *g == t.directive.full_name())
        })
    }

    /// Cancel one directive; no-op once it completed
    pub fn cancel_message(&self, message_id: &str) -> bool {
        self.inner.cancel_where(None, |t| t.directive.message_id == message_id) > 0
    }

    /// Cancel every live directive
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_where(None, |_| true)
    }

    /// Dialog of the last `cancel` call
    #[must_use]
    pub fn canceled_dialog_id(&self) -> Option<String> {
        self.inner.lock().canceled_dialog_id.clone()
    }

    /// Status of a live directive
    #[must_use]
    pub fn find_pending(&self, message_id: &str) -> Option<DirectiveStatus> {
        self.inner.lock().tracked.get(message_id).map(|t| t.status)
    }

    /// Oldest live directive of a type
    #[must_use]
    pub fn find_pending_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Directive>> {
        self.inner
            .lock()
            .tracked
            .values()
            .filter(|t| t.directive.namespace == namespace && t.directive.name == name)
            .min_by_key(|t| t.seq)
            .map(|t| Arc::clone(&t.directive))
    }

    /// Number of directives waiting for their medium
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of dispatched directives not yet completed
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .tracked
            .values()
            .filter(|t| t.status == DirectiveStatus::Active)
            .count()
    }

    /// Drop policies and every tracked directive without callbacks; listeners
    /// are kept
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        for tracked in state.tracked.values() {
            if let Some(id) = tracked.watchdog {
                self.inner.timer.cancel(id);
            }
            tracked.directive.set_active(false);
        }
        state.tracked.clear();
        state.pending.clear();
        state.ready.clear();
        state.blocking.clear();
        state.policies.clear();
        state.canceled_dialog_id = None;
    }
}

impl std::fmt::Debug for DirectiveSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("DirectiveSequencer")
            .field("tracked", &state.tracked.len())
            .field("pending", &state.pending)
            .field("blocking", &state.blocking)
            .finish_non_exhaustive()
    }
}
