//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use voice_orchestrator::capability::{Attachment, Event};
use voice_orchestrator::{
    BlockingPolicy, Capability, CapabilityCore, CapabilityHelper, Client, Config, Directive, Error,
    EventResult, FocusResourceListener, FocusState, ManualTimer, PlaySyncListener,
    PlaySyncState, Result, Session, SessionManagerListener, StealDecision, Transport,
};

/// Append-only string log shared between a fake and its test
#[derive(Default)]
pub struct Log(Mutex<Vec<String>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Focus resource that answers steal requests with a fixed decision
pub struct FocusProbe {
    pub decision: StealDecision,
    pub log: Log,
}

impl FocusProbe {
    pub fn allowing() -> Arc<Self> {
        Arc::new(Self {
            decision: StealDecision::Allow,
            log: Log::default(),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            decision: StealDecision::Reject,
            log: Log::default(),
        })
    }
}

impl FocusResourceListener for FocusProbe {
    fn on_focus_changed(&self, state: FocusState) {
        self.log.push(state.as_str());
    }

    fn on_steal_request(&self, requester_type: &str, _: &str) -> StealDecision {
        self.log.push(format!("steal:{requester_type}"));
        self.decision
    }
}

#[derive(Default)]
pub struct PlaySyncProbe {
    pub log: Log,
}

impl PlaySyncListener for PlaySyncProbe {
    fn on_sync_state(&self, ps_id: &str, state: PlaySyncState, _: Option<&Value>) {
        self.log.push(format!("{ps_id}:{state}"));
    }

    fn on_stack_removed(&self, ps_id: &str) {
        self.log.push(format!("{ps_id}:removed"));
    }
}

#[derive(Default)]
pub struct SessionProbe {
    pub log: Log,
}

impl SessionManagerListener for SessionProbe {
    fn activated(&self, dialog_id: &str, session: &Session) {
        self.log.push(format!("+{dialog_id}:{}", session.ps_id));
    }

    fn deactivated(&self, dialog_id: &str) {
        self.log.push(format!("-{dialog_id}"));
    }
}

/// Transport that keeps every event
#[derive(Default)]
pub struct RecordingTransport {
    pub events: Mutex<Vec<Event>>,
    pub attachments: Mutex<Vec<Attachment>>,
}

impl Transport for RecordingTransport {
    fn send_event(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn send_attachment(&self, attachment: &Attachment) -> Result<()> {
        self.attachments.lock().unwrap().push(attachment.clone());
        Ok(())
    }
}

/// Capability that records its hooks and completes only when told
pub struct FakeCapability {
    pub core: CapabilityCore,
    pub policies: Vec<(String, BlockingPolicy)>,
    pub log: Log,
    pub fail_initialize: AtomicBool,
}

impl FakeCapability {
    pub fn new(name: &str, policies: &[(&str, BlockingPolicy)]) -> Arc<Self> {
        Arc::new(Self {
            core: CapabilityCore::new(name, "1.0"),
            policies: policies
                .iter()
                .map(|(n, p)| ((*n).to_string(), *p))
                .collect(),
            log: Log::default(),
            fail_initialize: AtomicBool::new(false),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        let capability = Self::new(name, &[]);
        capability.fail_initialize.store(true, Ordering::SeqCst);
        capability
    }

    pub fn helper(&self) -> CapabilityHelper {
        self.core.helper().cloned().expect("capability not initialized")
    }
}

impl Capability for FakeCapability {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn version(&self) -> &str {
        self.core.version()
    }

    fn blocking_policies(&self) -> Vec<(String, BlockingPolicy)> {
        self.policies.clone()
    }

    fn initialize(&self, helper: CapabilityHelper) -> Result<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            self.log.push("initialize failed");
            return Err(Error::Capability("not ready".to_string()));
        }
        self.core.attach(helper);
        self.log.push("initialize");
        Ok(())
    }

    fn de_initialize(&self) {
        self.log.push("de_initialize");
    }

    fn process_directive(&self, directive: &Arc<Directive>) -> Result<()> {
        self.core.begin_directive(directive);
        self.log.push(format!("process:{}", directive.message_id));
        Ok(())
    }

    fn cancel_directive(&self, directive: &Arc<Directive>) {
        self.log.push(format!("cancel:{}", directive.message_id));
    }

    fn destroy_directive(&self, directive: &Arc<Directive>) {
        self.core.drop_directive(directive);
        self.log.push(format!("destroy:{}", directive.message_id));
    }

    fn receive_command_all(&self, command: &str, param: &str) {
        self.log.push(format!("{command}={param}"));
    }

    fn notify_event_result(&self, result: &EventResult) {
        self.log
            .push(format!("result:{}:{}", result.message_id, result.success));
    }
}

/// Client on a manual clock with a recording transport
pub fn client() -> (Client, Arc<ManualTimer>, Arc<RecordingTransport>) {
    let timer = Arc::new(ManualTimer::new());
    let transport = Arc::new(RecordingTransport::default());
    let client = Client::new(Config::default(), transport.clone(), timer.clone());
    (client, timer, transport)
}
