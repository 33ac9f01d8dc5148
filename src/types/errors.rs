//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use std::time::Duration;

use thiserror::Error;

use super::ids::MessageId;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by worker request handlers.
///
/// Its `Display` text is what travels back in the Response envelope's
/// `error` field.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for hosts, workers and clients.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport handle exposes none of the known capability shapes.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Request names an operation with no registered handler.
    #[error("unregistered handler: {0}")]
    UnregisteredHandler(String),

    /// Request issued with no live worker or channel behind it.
    #[error("process not running: {0}")]
    ProcessNotRunning(String),

    /// Settlement attempted on an entry that no longer accepts one.
    #[error("message {0} already settled")]
    AlreadySettled(MessageId),

    /// No response arrived inside the request window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Pending entry was cancelled by shutdown before it settled.
    #[error("abandoned: {0}")]
    Abandoned(String),

    /// Worker exited before acknowledging spawn.
    #[error("worker exited with code {0} upon starting")]
    StartupExit(i32),

    /// The peer answered with a failed Response envelope.
    #[error("{0}")]
    Remote(String),

    /// Name or client id is already taken.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// Lookup by name failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Service has not finished starting (or failed to start).
    #[error("not ready: {0}")]
    NotReady(String),

    /// The other end of a channel or link is gone.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The spawner could not start a worker.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Malformed or out-of-place message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable code used in logs and in failed bridge grants.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPort(_) => "INVALID_PORT",
            Error::UnregisteredHandler(_) => "UNREGISTERED_HANDLER",
            Error::ProcessNotRunning(_) => "PROCESS_NOT_RUNNING",
            Error::AlreadySettled(_) => "ALREADY_SETTLED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Abandoned(_) => "ABANDONED",
            Error::StartupExit(_) => "STARTUP_EXIT",
            Error::Remote(_) => "REMOTE",
            Error::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NotReady(_) => "NOT_READY",
            Error::ChannelClosed(_) => "CHANNEL_CLOSED",
            Error::Spawn(_) => "SPAWN",
            Error::Protocol(_) => "PROTOCOL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// True for the rejection produced when a request window elapses.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True for the rejection produced by registry teardown.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Error::Abandoned(_))
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_port(msg: impl Into<String>) -> Self {
        Self::InvalidPort(msg.into())
    }

    pub fn unregistered_handler(operation: impl Into<String>) -> Self {
        Self::UnregisteredHandler(operation.into())
    }

    pub fn process_not_running(msg: impl Into<String>) -> Self {
        Self::ProcessNotRunning(msg.into())
    }

    pub fn timeout(message_id: MessageId, after: Duration) -> Self {
        Self::Timeout(format!(
            "request {} got no response within {}ms",
            message_id,
            after.as_millis()
        ))
    }

    pub fn abandoned(message_id: MessageId) -> Self {
        Self::Abandoned(format!(
            "request {} was removed before it settled",
            message_id
        ))
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn already_registered(msg: impl Into<String>) -> Self {
        Self::AlreadyRegistered(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
