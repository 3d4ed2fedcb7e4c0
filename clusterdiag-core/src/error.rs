//! Error types for clusterdiag-core

use crate::types::DiagnosticTool;
use thiserror::Error;

/// Main error type for the clusterdiag-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error for session records
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A session is already active somewhere in the cluster
    #[error("a diagnostics session is already active")]
    SessionAlreadyActive,

    /// Submitted session has no tool
    #[error("no diagnostic tool specified for the session")]
    ToolNotSpecified,

    /// No adapter is registered for the requested tool
    #[error("no adapter registered for diagnostic tool: {0}")]
    UnknownTool(DiagnosticTool),

    /// Session not found in either store
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Lock could not be acquired within the retry budget
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Capture was cancelled while the tool was running
    #[error("diagnostics capture cancelled")]
    Cancelled,

    /// Tool adapter failure
    #[error("tool error: {0}")]
    Tool(String),
}

/// Result type alias for clusterdiag-core
pub type Result<T> = std::result::Result<T, Error>;
