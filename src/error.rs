//! Error types for agent and session operations.

use thiserror::Error;

/// The top-level error type for the crate.
///
/// Clonable so the completion latch can hand the same failure to every
/// `wait_for_idle` caller and to `error` listeners.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Model adapter rejection or stream failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// An event listener failed; the running turn is abandoned.
    #[error("listener error: {0}")]
    Listener(String),

    /// The session store rejected a read or write.
    #[error("store error: {0}")]
    Store(String),

    /// The channel between the turn loop and its driver closed unexpectedly.
    #[error("turn loop disconnected: {0}")]
    Disconnected(String),

    /// The operation requires an idle session but a turn is running.
    #[error("session is busy: {0}")]
    Busy(String),
}

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;
