//! Capability registry
//!
//! The registry owns every capability and is the directive listener for all
//! of their namespaces. It routes properties and commands between
//! capabilities, assembles context snapshots and tracks sent events until the
//! network layer reports their outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value, json};

use super::{Capability, CapabilityHelper, EventResult};
use crate::config::ContextConfig;
use crate::directive::{Directive, DirectiveListener};
use crate::playsync::PlaySyncManager;
use crate::{Error, Result};

/// Dialogs remembered for the first-seen broadcast
const RECENT_DIALOG_LIMIT: usize = 10;

/// Command broadcast with the groups of a newly seen dialog
pub const CMD_RECEIVE_DIRECTIVE_GROUP: &str = "receive_directive_group";
/// Command broadcast with the id of a newly seen dialog
pub const CMD_DIRECTIVE_DIALOG_ID: &str = "directive_dialog_id";

struct Entry {
    capability: Arc<dyn Capability>,
    initialized: bool,
}

struct PendingEvent {
    capability: String,
    dialog_request_id: String,
}

#[derive(Default)]
struct RegistryState {
    capabilities: BTreeMap<String, Entry>,
    recent_dialogs: VecDeque<String>,
    events: HashMap<String, PendingEvent>,
}

pub(crate) struct Shared {
    state: Mutex<RegistryState>,
    context: ContextConfig,
    play_sync: PlaySyncManager,
    dispatcher: Arc<dyn DirectiveListener>,
}

/// Owns capabilities and routes directives, commands and context between them
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<Shared>,
}

/// Non-owning registry handle held by capability helpers
#[derive(Clone, Default)]
pub(crate) struct WeakRegistry(Weak<Shared>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<CapabilityRegistry> {
        self.0.upgrade().map(|inner| CapabilityRegistry { inner })
    }
}

/// Sequencer-facing adapter; weak so the sequencer never keeps capabilities
/// alive
struct Dispatcher {
    registry: Weak<Shared>,
}

impl Dispatcher {
    fn registry(&self) -> Option<CapabilityRegistry> {
        self.registry
            .upgrade()
            .map(|inner| CapabilityRegistry { inner })
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

impl DirectiveListener for Dispatcher {
    fn on_pre_handle_directive(&self, directive: &Arc<Directive>) -> bool {
        let Some(capability) = self.registry().and_then(|r| r.find(&directive.namespace)) else {
            return false;
        };
        if major(&directive.version) != major(capability.version()) {
            tracing::error!(
                namespace = %directive.namespace,
                name = %directive.name,
                directive_version = %directive.version,
                capability_version = %capability.version(),
                "directive version not supported, dropping"
            );
            return true;
        }
        capability.preprocess_directive(directive);
        false
    }

    fn on_handle_directive(&self, directive: &Arc<Directive>) -> Result<()> {
        let registry = self
            .registry()
            .ok_or_else(|| Error::NotFound(directive.namespace.clone()))?;
        registry.note_dialog(directive);
        let capability = registry
            .find(&directive.namespace)
            .ok_or_else(|| Error::NotFound(directive.namespace.clone()))?;
        capability.process_directive(directive)
    }

    fn on_cancel_directive(&self, directive: &Arc<Directive>) {
        if let Some(capability) = self.registry().and_then(|r| r.find(&directive.namespace)) {
            capability.cancel_directive(directive);
        }
    }

    fn on_complete_directive(&self, directive: &Arc<Directive>) {
        if let Some(capability) = self.registry().and_then(|r| r.find(&directive.namespace)) {
            capability.destroy_directive(directive);
        }
    }
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new(context: ContextConfig, play_sync: PlaySyncManager) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            state: Mutex::new(RegistryState::default()),
            context,
            play_sync,
            dispatcher: Arc::new(Dispatcher {
                registry: weak.clone(),
            }),
        });
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    /// Listener to register with the sequencer for every capability namespace
    #[must_use]
    pub fn directive_listener(&self) -> Arc<dyn DirectiveListener> {
        Arc::clone(&self.inner.dispatcher)
    }

    /// Add a capability under its name
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is empty or taken
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name().to_string();
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty capability name".to_string()));
        }
        let mut state = self.lock();
        if state.capabilities.contains_key(&name) {
            return Err(Error::InvalidArgument(format!(
                "capability already registered: {name}"
            )));
        }
        tracing::info!(capability = %name, version = %capability.version(), "capability registered");
        state.capabilities.insert(
            name,
            Entry {
                capability,
                initialized: false,
            },
        );
        Ok(())
    }

    /// Remove a capability, de-initializing it first if needed
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let entry = self.lock().capabilities.remove(name)?;
        if entry.initialized {
            entry.capability.de_initialize();
        }
        tracing::info!(capability = %name, "capability unregistered");
        Some(entry.capability)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.lock()
            .capabilities
            .get(name)
            .map(|e| Arc::clone(&e.capability))
    }

    /// Registered capability names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.lock().capabilities.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().capabilities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().capabilities.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Capability>> {
        self.lock()
            .capabilities
            .values()
            .map(|e| Arc::clone(&e.capability))
            .collect()
    }

    /// Initialize every capability that is not yet initialized
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure; the remaining capabilities
    /// are still initialized
    pub fn initialize_all(&self, helper: &CapabilityHelper) -> Result<()> {
        let todo: Vec<(String, Arc<dyn Capability>)> = self
            .lock()
            .capabilities
            .iter()
            .filter(|(_, e)| !e.initialized)
            .map(|(n, e)| (n.clone(), Arc::clone(&e.capability)))
            .collect();

        let mut first_error = None;
        for (name, capability) in todo {
            if let Err(e) = self.initialize_entry(&name, &capability, helper) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Initialize one capability; a no-op if it already is
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown name, or the
    /// capability's own initialization failure
    pub fn initialize(&self, name: &str, helper: &CapabilityHelper) -> Result<()> {
        let capability = {
            let state = self.lock();
            let entry = state
                .capabilities
                .get(name)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown capability {name}")))?;
            if entry.initialized {
                return Ok(());
            }
            Arc::clone(&entry.capability)
        };
        self.initialize_entry(name, &capability, helper)
    }

    fn initialize_entry(
        &self,
        name: &str,
        capability: &Arc<dyn Capability>,
        helper: &CapabilityHelper,
    ) -> Result<()> {
        match capability.initialize(helper.clone()) {
            Ok(()) => {
                if let Some(entry) = self.lock().capabilities.get_mut(name) {
                    entry.initialized = true;
                }
                tracing::info!(capability = %name, "capability initialized");
                Ok(())
            }
            Err(e) => {
                tracing::error!(capability = %name, error = %e, "capability initialization failed");
                Err(Error::Capability(format!("{name}: {e}")))
            }
        }
    }

    /// De-initialize every initialized capability
    pub fn de_initialize_all(&self) {
        let todo: Vec<Arc<dyn Capability>> = {
            let mut state = self.lock();
            state
                .capabilities
                .values_mut()
                .filter(|e| e.initialized)
                .map(|e| {
                    e.initialized = false;
                    Arc::clone(&e.capability)
                })
                .collect()
        };
        for capability in todo {
            capability.de_initialize();
            tracing::info!(capability = %capability.name(), "capability de-initialized");
        }
    }

    #[must_use]
    pub fn is_initialized(&self, name: &str) -> bool {
        self.lock()
            .capabilities
            .get(name)
            .is_some_and(|e| e.initialized)
    }

    pub fn suspend_all(&self) {
        for capability in self.snapshot() {
            tracing::debug!(capability = %capability.name(), policy = %capability.suspend_policy(), "suspending");
            capability.suspend();
        }
    }

    pub fn restore_all(&self) {
        for capability in self.snapshot() {
            capability.restore();
        }
    }

    /// Drop every capability without de-initializing
    pub fn clear(&self) {
        let mut state = self.lock();
        state.capabilities.clear();
        state.events.clear();
        state.recent_dialogs.clear();
    }

    /// Deliver a command to one capability
    ///
    /// Returns `false` if the target is unknown or ignored the command.
    pub fn send_command(&self, from: &str, to: &str, command: &str, param: &str) -> bool {
        self.find(to)
            .is_some_and(|c| c.receive_command(from, command, param))
    }

    /// Broadcast a command to every capability
    pub fn send_command_all(&self, command: &str, param: &str) {
        for capability in self.snapshot() {
            capability.receive_command_all(command, param);
        }
    }

    #[must_use]
    pub fn property(&self, capability: &str, key: &str) -> Option<String> {
        self.find(capability)?.property(key)
    }

    #[must_use]
    pub fn properties(&self, capability: &str, key: &str) -> Vec<String> {
        self.find(capability)
            .map(|c| c.properties(key))
            .unwrap_or_default()
    }

    fn compact_context(capability: &dyn Capability) -> Value {
        let mut ctx = Map::new();
        ctx.insert("version".to_string(), json!(capability.version()));
        capability.update_compact_context(&mut ctx);
        Value::Object(ctx)
    }

    fn full_context(capability: &dyn Capability) -> Value {
        capability
            .context_info()
            .unwrap_or_else(|| Self::compact_context(capability))
    }

    fn client_context(&self) -> Value {
        json!({
            "wakeupWord": self.inner.context.wakeup_word,
            "os": self.inner.context.os,
            "playStack": self.inner.play_sync.get_all_play_stack_items(),
        })
    }

    /// Context for an event from `cname`: its full context and the compact
    /// context of everyone else
    #[must_use]
    pub fn make_context_info(&self, cname: &str) -> Value {
        let interfaces: Map<String, Value> = self
            .snapshot()
            .iter()
            .map(|c| {
                let ctx = if c.name() == cname {
                    Self::full_context(c.as_ref())
                } else {
                    Self::compact_context(c.as_ref())
                };
                (c.name().to_string(), ctx)
            })
            .collect();
        json!({
            "supportedInterfaces": interfaces,
            "client": self.client_context(),
        })
    }

    /// Full context of every capability
    #[must_use]
    pub fn make_all_context_info(&self) -> Value {
        let interfaces: Map<String, Value> = self
            .snapshot()
            .iter()
            .map(|c| (c.name().to_string(), Self::full_context(c.as_ref())))
            .collect();
        json!({
            "supportedInterfaces": interfaces,
            "client": self.client_context(),
        })
    }

    /// Broadcast the first directive of each dialog
    fn note_dialog(&self, directive: &Directive) {
        {
            let mut state = self.lock();
            if state
                .recent_dialogs
                .iter()
                .any(|d| *d == directive.dialog_request_id)
            {
                return;
            }
            if state.recent_dialogs.len() == RECENT_DIALOG_LIMIT {
                state.recent_dialogs.pop_front();
            }
            state
                .recent_dialogs
                .push_back(directive.dialog_request_id.clone());
        }
        self.send_command_all(CMD_RECEIVE_DIRECTIVE_GROUP, &directive.groups.join(","));
        self.send_command_all(CMD_DIRECTIVE_DIALOG_ID, &directive.dialog_request_id);
    }

    /// Track an event until the network reports its outcome
    pub fn request_event_result(&self, capability: &str, message_id: &str, dialog_request_id: &str) {
        self.lock().events.insert(
            message_id.to_string(),
            PendingEvent {
                capability: capability.to_string(),
                dialog_request_id: dialog_request_id.to_string(),
            },
        );
    }

    /// Number of events awaiting an outcome
    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub(crate) fn forget_event(&self, message_id: &str) {
        self.lock().events.remove(message_id);
    }

    /// Report whether a tracked event reached the server
    ///
    /// A failed send ends tracking; a successful one waits for the response.
    pub fn on_event_send_result(&self, message_id: &str, success: bool, code: i32) {
        let (capability, dialog_request_id) = {
            let mut state = self.lock();
            let Some(pending) = state.events.get(message_id) else {
                tracing::debug!(message_id, "send result for untracked event");
                return;
            };
            let found = (pending.capability.clone(), pending.dialog_request_id.clone());
            if !success {
                state.events.remove(message_id);
            }
            found
        };
        let result = EventResult {
            message_id: message_id.to_string(),
            dialog_request_id,
            success,
            code,
        };
        if !success {
            tracing::warn!(message_id, code, capability = %capability, "event send failed");
        }
        if let Some(capability) = self.find(&capability) {
            capability.notify_event_result(&result);
        }
    }

    /// Fail every tracked event, as no outcome will arrive for them
    ///
    /// Each owning capability gets a failed [`EventResult`] with code 0.
    /// Returns how many events were dropped.
    pub fn fail_pending_events(&self) -> usize {
        let pending: Vec<(String, PendingEvent)> = self.lock().events.drain().collect();
        for (message_id, event) in &pending {
            tracing::warn!(
                message_id = %message_id,
                capability = %event.capability,
                "event abandoned, no send result"
            );
            let result = EventResult {
                message_id: message_id.clone(),
                dialog_request_id: event.dialog_request_id.clone(),
                success: false,
                code: 0,
            };
            if let Some(capability) = self.find(&event.capability) {
                capability.notify_event_result(&result);
            }
        }
        pending.len()
    }

    /// Report the server's response to a tracked event and stop tracking it
    pub fn on_event_response(&self, message_id: &str, data: Option<&Value>, success: bool) {
        let Some(pending) = self.lock().events.remove(message_id) else {
            tracing::debug!(message_id, "response for untracked event");
            return;
        };
        if let Some(capability) = self.find(&pending.capability) {
            capability.notify_event_response(message_id, data, success);
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish_non_exhaustive()
    }
}
