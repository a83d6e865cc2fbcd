//! Voice Orchestrator - capability orchestration core for voice-assistant clients
//!
//! This library sits between the cloud voice service and the capability
//! modules of a device (speech recognition, speech synthesis, audio playback,
//! display and so on):
//! - Directive sequencing with per-medium blocking and cancellation
//! - Priority-based focus arbitration with steal negotiation
//! - Play-sync lifecycle shared by every capability rendering one response
//! - Dialog session and multi-turn window tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Network layer                       │
//! │        directives in  │  events/attachments out      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │     Client  →  DirectiveSequencer  →  Registry       │
//! │                                   │                  │
//! │   TTS  │  ASR  │  AudioPlayer  │  Display  │  ...   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ CapabilityHelper
//! ┌────────────────────▼────────────────────────────────┐
//! │  Focus  │  PlaySync  │  Session  │  Interaction     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capability;
pub mod client;
pub mod config;
pub mod directive;
pub mod error;
pub mod focus;
pub mod interaction;
pub mod playsync;
pub mod session;
pub mod timer;

pub use capability::{
    Capability, CapabilityCore, CapabilityHelper, CapabilityRegistry, Event, EventReceipt,
    EventRequest, EventResult, SuspendPolicy, Transport,
};
pub use client::Client;
pub use config::Config;
pub use directive::{
    BlockingMedium, BlockingPolicy, Directive, DirectiveListener, DirectiveSequencer,
    DirectiveStatus,
};
pub use error::{Error, Result};
pub use focus::{
    FocusConfiguration, FocusManager, FocusManagerObserver, FocusOutcome, FocusResourceListener,
    FocusState, RejectPolicy, StealDecision,
};
pub use interaction::{InteractionControlListener, InteractionControlManager, InteractionMode};
pub use playsync::{
    PlayStackHoldTime, PlayStackLayer, PlaySyncListener, PlaySyncManager, PlaySyncState,
};
pub use session::{Session, SessionManager, SessionManagerListener, SessionState};
pub use timer::{ManualTimer, Timer, TimerId, TokioTimer};
