//! Orchestrator root
//!
//! [`Client`] builds the managers from [`Config`], wires capabilities to them
//! and is the entry point for everything the network layer delivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::capability::{Capability, CapabilityHelper, CapabilityRegistry, Transport};
use crate::config::Config;
use crate::directive::{Directive, DirectiveSequencer};
use crate::focus::FocusManager;
use crate::interaction::InteractionControlManager;
use crate::playsync::PlaySyncManager;
use crate::session::SessionManager;
use crate::timer::Timer;
use crate::Result;

/// Command broadcast when the network connection drops
pub const CMD_NETWORK_DISCONNECTED: &str = "network_disconnected";

/// Owns the managers and the capabilities wired to them
pub struct Client {
    config: Config,
    sequencer: DirectiveSequencer,
    focus: FocusManager,
    play_sync: PlaySyncManager,
    session: SessionManager,
    interaction: InteractionControlManager,
    registry: CapabilityRegistry,
    helper: CapabilityHelper,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl Client {
    /// Build every manager from `config`
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>, timer: Arc<dyn Timer>) -> Self {
        let sequencer =
            DirectiveSequencer::new(Arc::clone(&timer), config.sequencer.directive_timeout);
        let focus = FocusManager::new(
            config.focus.configurations.clone(),
            config.focus.reject_policy,
        );
        let play_sync = PlaySyncManager::with_capabilities(
            timer,
            config.play_sync.hold_time,
            config.play_sync.sync_capabilities.clone(),
        );
        let session = SessionManager::new();
        let interaction = InteractionControlManager::new();
        play_sync.set_interaction_control_manager(interaction.clone());

        let registry = CapabilityRegistry::new(config.context.clone(), play_sync.clone());
        let helper = CapabilityHelper::new(
            sequencer.clone(),
            focus.clone(),
            play_sync.clone(),
            session.clone(),
            interaction.clone(),
            registry.downgrade(),
            transport,
        );

        tracing::info!(
            focus_types = config.focus.configurations.len(),
            reject_policy = %config.focus.reject_policy,
            watchdog = ?config.sequencer.directive_timeout,
            "orchestrator created"
        );

        Self {
            config,
            sequencer,
            focus,
            play_sync,
            session,
            interaction,
            registry,
            helper,
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a capability, its namespace and its blocking policies
    ///
    /// A capability added after [`Client::initialize`] is initialized at once.
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken, a blocking policy is declared
    /// twice, or late initialization fails; nothing stays registered then
    pub fn add_capability(&self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name().to_string();
        self.registry.register(Arc::clone(&capability))?;
        self.sequencer
            .add_listener(&name, self.registry.directive_listener());

        let policies = capability.blocking_policies();
        for (index, (directive, policy)) in policies.iter().enumerate() {
            if let Err(e) = self.sequencer.add_policy(&name, directive, *policy) {
                for (added, _) in &policies[..index] {
                    self.sequencer.remove_policy(&name, added);
                }
                self.unwire(&name);
                return Err(e);
            }
        }

        if self.initialized.load(Ordering::Acquire) {
            if let Err(e) = self.registry.initialize(&name, &self.helper) {
                self.remove_capability(&name);
                return Err(e);
            }
        }
        Ok(())
    }

    fn unwire(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.sequencer
            .remove_listener(name, &self.registry.directive_listener());
        self.registry.unregister(name)
    }

    /// Undo [`Client::add_capability`]
    pub fn remove_capability(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let capability = self.registry.find(name)?;
        for (directive, _) in capability.blocking_policies() {
            self.sequencer.remove_policy(name, &directive);
        }
        self.unwire(name)
    }

    /// Initialize every registered capability
    ///
    /// # Errors
    ///
    /// Returns the first capability initialization failure
    pub fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        self.registry.initialize_all(&self.helper)
    }

    pub fn de_initialize(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.registry.de_initialize_all();
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn suspend_all(&self) {
        self.registry.suspend_all();
    }

    pub fn restore_all(&self) {
        self.registry.restore_all();
    }

    /// Hand an inbound directive to the sequencer
    ///
    /// # Errors
    ///
    /// Returns error if the message id is live or nobody handles the
    /// namespace
    pub fn handle_directive(&self, directive: Directive) -> Result<()> {
        self.sequencer.add(directive)
    }

    /// Parse and handle one `{header, payload}` envelope
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is malformed or the directive is
    /// rejected
    pub fn handle_directive_json(&self, json: &str) -> Result<()> {
        self.handle_directive(Directive::from_json(json)?)
    }

    /// Parse a `{"directives": [...]}` response and handle each directive
    ///
    /// Rejected directives are logged and skipped. Returns how many were
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the response is malformed
    pub fn handle_response_json(&self, json: &str) -> Result<usize> {
        let mut accepted = 0;
        for directive in Directive::parse_response(json)? {
            let full_name = directive.full_name();
            let message_id = directive.message_id.clone();
            match self.handle_directive(directive) {
                Ok(()) => accepted += 1,
                Err(e) => tracing::warn!(
                    directive = %full_name,
                    message_id = %message_id,
                    error = %e,
                    "directive rejected"
                ),
            }
        }
        Ok(accepted)
    }

    pub fn on_event_send_result(&self, message_id: &str, success: bool, code: i32) {
        self.registry.on_event_send_result(message_id, success, code);
    }

    pub fn on_event_response(&self, message_id: &str, data: Option<&Value>, success: bool) {
        self.registry.on_event_response(message_id, data, success);
    }

    /// Fail in-flight events and tell every capability the link is down
    pub fn on_network_disconnected(&self) {
        let abandoned = self.registry.fail_pending_events();
        tracing::info!(abandoned, "network disconnected");
        self.registry.send_command_all(CMD_NETWORK_DISCONNECTED, "");
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
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

    #[must_use]
    pub const fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn helper(&self) -> &CapabilityHelper {
        &self.helper
    }

    /// Tear everything down; later calls do nothing
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.de_initialize();
        let cancelled = self.sequencer.cancel_all();
        self.focus.stop_all_focus();
        self.play_sync.clear();
        self.session.clear();
        self.interaction.clear();
        for name in self.registry.names() {
            self.sequencer
                .remove_listener(&name, &self.registry.directive_listener());
        }
        self.registry.clear();
        tracing::info!(cancelled, "orchestrator shut down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("capabilities", &self.registry.names())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}
