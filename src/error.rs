//! Error types for the voice orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller supplied an empty or malformed argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A directive with the same message id is already tracked
    #[error("duplicate message id: {0}")]
    DuplicateMessage(String),

    /// No listener registered for the directive namespace
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// Blocking policy already registered for a directive type
    #[error("policy already registered: {0}")]
    PolicyExists(String),

    /// Focus type has no configured priority
    #[error("focus type not configured: {0}")]
    FocusUnconfigured(String),

    /// Play-sync entry or participant was never prepared
    #[error("play-sync not prepared: {0}")]
    NotPrepared(String),

    /// Participant already synced and can no longer cancel
    #[error("sync already started: {0}")]
    SyncAlreadyStarted(String),

    /// Multi-turn window is held by another requester
    #[error("interaction busy: {0}")]
    InteractionBusy(String),

    /// Capability error
    #[error("capability error: {0}")]
    Capability(String),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
