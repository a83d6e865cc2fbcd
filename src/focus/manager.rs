//! Focus table and arbitration

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    FocusConfiguration, FocusManagerObserver, FocusOutcome, FocusResourceListener, FocusState,
    RejectPolicy, StealDecision,
};
use crate::{Error, Result};

struct Resource {
    focus_type: String,
    name: String,
    priority: u32,
    seq: u64,
    state: FocusState,
    listener: Arc<dyn FocusResourceListener>,
}

/// Notification collected under the lock and delivered after it is released
struct Change {
    configuration: FocusConfiguration,
    name: String,
    state: FocusState,
    listener: Arc<dyn FocusResourceListener>,
}

impl Change {
    fn of(resource: &Resource, state: FocusState) -> Self {
        Self {
            configuration: FocusConfiguration::new(resource.focus_type.clone(), resource.priority),
            name: resource.name.clone(),
            state,
            listener: Arc::clone(&resource.listener),
        }
    }
}

#[derive(Default)]
struct FocusTable {
    priorities: HashMap<String, u32>,
    /// At most one resource per type
    resources: Vec<Resource>,
    /// Pinned types; a held type with no resource is a reservation
    held: HashSet<String>,
    reject_policy: RejectPolicy,
    seq: u64,
}

impl FocusTable {
    fn priority(&self, focus_type: &str) -> Result<u32> {
        self.priorities
            .get(focus_type)
            .copied()
            .ok_or_else(|| Error::FocusUnconfigured(focus_type.to_string()))
    }

    fn position_of_type(&self, focus_type: &str) -> Option<usize> {
        self.resources.iter().position(|r| r.focus_type == focus_type)
    }

    fn foreground(&self) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.state == FocusState::Foreground)
    }

    /// A reservation of equal or higher priority keeps `priority` out of the foreground
    ///
    /// The reservation on `own_type` is skipped, since a requester of that
    /// type is the one it waits for.
    fn reserved_above(&self, priority: u32, own_type: Option<&str>) -> bool {
        self.held.iter().any(|t| {
            own_type != Some(t.as_str())
                && self.position_of_type(t).is_none()
                && self.priorities.get(t).is_some_and(|p| *p <= priority)
        })
    }

    fn insert(
        &mut self,
        focus_type: &str,
        name: &str,
        priority: u32,
        state: FocusState,
        listener: Arc<dyn FocusResourceListener>,
        changes: &mut Vec<Change>,
    ) {
        self.seq += 1;
        let resource = Resource {
            focus_type: focus_type.to_string(),
            name: name.to_string(),
            priority,
            seq: self.seq,
            state,
            listener,
        };
        changes.push(Change::of(&resource, state));
        self.resources.push(resource);
    }

    fn reject(
        &mut self,
        focus_type: &str,
        name: &str,
        priority: u32,
        listener: Arc<dyn FocusResourceListener>,
        changes: &mut Vec<Change>,
    ) -> FocusOutcome {
        match self.reject_policy {
            RejectPolicy::Deny => FocusOutcome::Denied,
            RejectPolicy::Background => {
                self.insert(
                    focus_type,
                    name,
                    priority,
                    FocusState::Background,
                    listener,
                    changes,
                );
                FocusOutcome::Background
            }
        }
    }

    /// Promote the best background resource when nothing is in the foreground
    fn promote(&mut self, changes: &mut Vec<Change>) {
        if self.foreground().is_some() {
            return;
        }
        let best = self
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == FocusState::Background)
            .min_by_key(|(_, r)| (r.priority, r.seq))
            .map(|(i, r)| (i, r.priority));
        if let Some((idx, priority)) = best {
            if self.reserved_above(priority, None) {
                return;
            }
            let resource = &mut self.resources[idx];
            resource.state = FocusState::Foreground;
            changes.push(Change::of(resource, FocusState::Foreground));
        }
    }
}

struct Shared {
    table: Mutex<FocusTable>,
    observers: Mutex<Vec<Arc<dyn FocusManagerObserver>>>,
}

/// Arbitrates focus among named requesters
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct FocusManager {
    inner: Arc<Shared>,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new(super::default_configurations(), RejectPolicy::default())
    }
}

impl FocusManager {
    /// Create a manager with a priority table and steal-rejection policy
    #[must_use]
    pub fn new(configurations: Vec<FocusConfiguration>, reject_policy: RejectPolicy) -> Self {
        let manager = Self {
            inner: Arc::new(Shared {
                table: Mutex::new(FocusTable {
                    reject_policy,
                    ..FocusTable::default()
                }),
                observers: Mutex::new(Vec::new()),
            }),
        };
        manager.set_configurations(configurations);
        manager
    }

    fn table(&self) -> MutexGuard<'_, FocusTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> Vec<Arc<dyn FocusManagerObserver>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let observers = self.observers();
        for change in changes {
            tracing::info!(
                focus_type = %change.configuration.focus_type,
                name = %change.name,
                state = %change.state,
                "focus changed"
            );
            change.listener.on_focus_changed(change.state);
            for observer in &observers {
                observer.on_focus_changed(&change.configuration, change.state, &change.name);
            }
        }
    }

    /// Replace the priority table
    pub fn set_configurations(&self, configurations: Vec<FocusConfiguration>) {
        let mut table = self.table();
        table.priorities = configurations
            .into_iter()
            .map(|c| (c.focus_type, c.priority))
            .collect();
        tracing::debug!(count = table.priorities.len(), "focus configurations set");
    }

    /// Current priority table, highest priority first
    #[must_use]
    pub fn configurations(&self) -> Vec<FocusConfiguration> {
        let mut list: Vec<_> = self
            .table()
            .priorities
            .iter()
            .map(|(t, p)| FocusConfiguration::new(t.clone(), *p))
            .collect();
        list.sort_by(|a, b| (a.priority, &a.focus_type).cmp(&(b.priority, &b.focus_type)));
        list
    }

    /// Priority of a configured type
    #[must_use]
    pub fn priority(&self, focus_type: &str) -> Option<u32> {
        self.table().priorities.get(focus_type).copied()
    }

    /// Change how rejected steal attempts are treated
    pub fn set_reject_policy(&self, policy: RejectPolicy) {
        self.table().reject_policy = policy;
    }

    #[must_use]
    pub fn reject_policy(&self) -> RejectPolicy {
        self.table().reject_policy
    }

    /// Register a global observer; duplicates are ignored
    pub fn add_observer(&self, observer: Arc<dyn FocusManagerObserver>) {
        let mut observers = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Arc<dyn FocusManagerObserver>) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Request focus for `name` on `focus_type`
    ///
    /// The incumbent's steal callback runs synchronously, outside the table
    /// lock, before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FocusUnconfigured`] if the type has no priority
    pub fn request_focus(
        &self,
        focus_type: &str,
        name: &str,
        listener: Arc<dyn FocusResourceListener>,
    ) -> Result<FocusOutcome> {
        let mut changes = Vec::new();
        let mut reservation = false;
        let outcome = loop {
            let mut table = self.table();
            let priority = table.priority(focus_type)?;

            if let Some(idx) = table.position_of_type(focus_type) {
                if table.resources[idx].name == name {
                    let existing = &mut table.resources[idx];
                    existing.listener = Arc::clone(&listener);
                    break if existing.state == FocusState::Foreground {
                        FocusOutcome::Foreground
                    } else {
                        FocusOutcome::Background
                    };
                }
                // A pinned resource keeps its type; one resource per type
                if table.held.contains(focus_type) {
                    tracing::debug!(
                        focus_type,
                        requester = name,
                        holder = %table.resources[idx].name,
                        "focus type pinned, request denied"
                    );
                    break FocusOutcome::Denied;
                }
                let old = table.resources.remove(idx);
                changes.push(Change::of(&old, FocusState::None));
            }

            reservation = table.held.contains(focus_type);

            let Some(fg) = table.foreground() else {
                let state = if table.reserved_above(priority, Some(focus_type)) {
                    FocusState::Background
                } else {
                    FocusState::Foreground
                };
                table.insert(focus_type, name, priority, state, listener, &mut changes);
                break if state == FocusState::Foreground {
                    FocusOutcome::Foreground
                } else {
                    FocusOutcome::Background
                };
            };

            let incumbent = &table.resources[fg];
            let incumbent_held = table.held.contains(&incumbent.focus_type);

            if priority >= incumbent.priority {
                if incumbent_held {
                    break FocusOutcome::Denied;
                }
                table.insert(
                    focus_type,
                    name,
                    priority,
                    FocusState::Background,
                    listener,
                    &mut changes,
                );
                break FocusOutcome::Background;
            }

            if incumbent_held {
                break table.reject(focus_type, name, priority, listener, &mut changes);
            }

            // Ask the incumbent without holding the lock
            let incumbent_type = incumbent.focus_type.clone();
            let incumbent_name = incumbent.name.clone();
            let incumbent_listener = Arc::clone(&incumbent.listener);
            drop(table);

            let decision = incumbent_listener.on_steal_request(focus_type, name);
            let keep_in_background = incumbent_listener.can_run_in_background();

            let mut table = self.table();
            let still_incumbent = table.foreground().is_some_and(|i| {
                let r = &table.resources[i];
                r.focus_type == incumbent_type && r.name == incumbent_name
            });
            if !still_incumbent {
                drop(table);
                continue;
            }

            if decision == StealDecision::Reject {
                tracing::debug!(
                    requester = name,
                    incumbent = %incumbent_name,
                    "focus steal rejected"
                );
                break table.reject(focus_type, name, priority, listener, &mut changes);
            }

            let Some(idx) = table.foreground() else {
                continue;
            };
            if keep_in_background {
                let resource = &mut table.resources[idx];
                resource.state = FocusState::Background;
                changes.push(Change::of(resource, FocusState::Background));
            } else {
                let resource = table.resources.remove(idx);
                changes.push(Change::of(&resource, FocusState::None));
            }
            table.insert(
                focus_type,
                name,
                priority,
                FocusState::Foreground,
                listener,
                &mut changes,
            );
            break FocusOutcome::Foreground;
        };

        if reservation && outcome != FocusOutcome::Denied && self.table().held.remove(focus_type) {
            tracing::debug!(focus_type, "focus reservation consumed");
        }
        self.deliver(changes);
        Ok(outcome)
    }

    /// Release focus held by `name`
    ///
    /// Returns `false` when `name` holds nothing on that type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FocusUnconfigured`] if the type has no priority
    pub fn release_focus(&self, focus_type: &str, name: &str) -> Result<bool> {
        let mut changes = Vec::new();
        {
            let mut table = self.table();
            table.priority(focus_type)?;

            let Some(idx) = table
                .resources
                .iter()
                .position(|r| r.focus_type == focus_type && r.name == name)
            else {
                tracing::debug!(focus_type, name, "release ignored, focus not held");
                return Ok(false);
            };

            let resource = table.resources.remove(idx);
            changes.push(Change::of(&resource, FocusState::None));
            if resource.state == FocusState::Foreground {
                table.promote(&mut changes);
            }
        }
        self.deliver(changes);
        Ok(true)
    }

    /// Pin a type so its resource cannot be stolen
    ///
    /// Holding a type with no resource reserves it: lower-priority requesters
    /// stay in the background until the type is requested or unheld.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FocusUnconfigured`] if the type has no priority
    pub fn hold_focus(&self, focus_type: &str) -> Result<()> {
        let mut table = self.table();
        table.priority(focus_type)?;
        table.held.insert(focus_type.to_string());
        tracing::debug!(focus_type, "focus held");
        Ok(())
    }

    /// Remove a pin or reservation
    ///
    /// # Errors
    ///
    /// Returns [`Error::FocusUnconfigured`] if the type has no priority
    pub fn unhold_focus(&self, focus_type: &str) -> Result<()> {
        let mut changes = Vec::new();
        {
            let mut table = self.table();
            table.priority(focus_type)?;
            if table.held.remove(focus_type) {
                tracing::debug!(focus_type, "focus unheld");
                table.promote(&mut changes);
            }
        }
        self.deliver(changes);
        Ok(())
    }

    /// Whether a type is pinned or reserved
    #[must_use]
    pub fn is_held(&self, focus_type: &str) -> bool {
        self.table().held.contains(focus_type)
    }

    /// Drop every resource and hold
    pub fn stop_all_focus(&self) {
        let changes: Vec<_> = {
            let mut table = self.table();
            table.held.clear();
            let mut resources = std::mem::take(&mut table.resources);
            // Foreground first, then background in priority order
            resources.sort_by_key(|r| (r.state != FocusState::Foreground, r.priority, r.seq));
            resources
                .iter()
                .map(|r| Change::of(r, FocusState::None))
                .collect()
        };
        self.deliver(changes);
    }

    /// Drop the foreground resource and promote the next one
    pub fn stop_foreground_focus(&self) {
        let mut changes = Vec::new();
        {
            let mut table = self.table();
            if let Some(idx) = table.foreground() {
                let resource = table.resources.remove(idx);
                changes.push(Change::of(&resource, FocusState::None));
                table.promote(&mut changes);
            }
        }
        self.deliver(changes);
    }

    /// Focus state of a resource, `None` state when absent
    #[must_use]
    pub fn state(&self, focus_type: &str, name: &str) -> FocusState {
        self.table()
            .resources
            .iter()
            .find(|r| r.focus_type == focus_type && r.name == name)
            .map_or(FocusState::None, |r| r.state)
    }

    /// Type and name of the foreground resource
    #[must_use]
    pub fn foreground(&self) -> Option<(String, String)> {
        let table = self.table();
        table
            .foreground()
            .map(|i| (table.resources[i].focus_type.clone(), table.resources[i].name.clone()))
    }
}

impl std::fmt::Debug for FocusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table();
        f.debug_struct("FocusManager")
            .field("resources", &table.resources.len())
            .field("held", &table.held)
            .field("reject_policy", &table.reject_policy)
            .finish_non_exhaustive()
    }
}
