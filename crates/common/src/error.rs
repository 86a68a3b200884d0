//! Common error types for Lockstep
//!
//! This module defines all error types used across the Lockstep system.
//! The first four variants are the coordination taxonomy: a process that
//! cannot join its group, an external step (model load, generation) that
//! failed, an invalid configuration or collective shape, and a group that
//! aborted together after a health check.

use lockstep_proto::FaultKind;
use thiserror::Error;

/// Main error type for Lockstep
#[derive(Error, Debug)]
pub enum LockstepError {
    /// The process could not join its group
    #[error("Group formation error: {0}")]
    GroupFormation(String),

    /// Model loading or work execution failed on this rank
    #[error("External step error: {0}")]
    ExternalStep(String),

    /// Invalid configuration, task list or collective shape
    #[error("Configuration error: {0}")]
    Config(String),

    /// A health check saw failures on some ranks; every rank stops
    #[error("Group aborted: {failed_ranks} rank(s) reported failure")]
    GroupAborted { failed_ranks: usize },

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Peer violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LockstepError {
    /// Stable label for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            LockstepError::GroupFormation(_) => "group_formation",
            LockstepError::ExternalStep(_) => "external_step",
            LockstepError::Config(_) => "config",
            LockstepError::GroupAborted { .. } => "group_aborted",
            LockstepError::Connection(_) => "connection",
            LockstepError::Protocol(_) => "protocol",
            LockstepError::Timeout(_) => "timeout",
            LockstepError::Io(_) => "io",
            LockstepError::Serialization(_) => "serialization",
            LockstepError::Internal(_) => "internal",
        }
    }

    /// Map a hub fault onto the local taxonomy
    pub fn from_fault(kind: FaultKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            FaultKind::ShapeMismatch => LockstepError::Config(message),
            FaultKind::DuplicateRank | FaultKind::SizeMismatch => {
                LockstepError::GroupFormation(message)
            }
            FaultKind::Protocol | FaultKind::Unspecified => LockstepError::Protocol(message),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LockstepError::Config(msg.into())
    }

    /// Create a group formation error
    pub fn group_formation(msg: impl Into<String>) -> Self {
        LockstepError::GroupFormation(msg.into())
    }

    /// Create an external step error
    pub fn external(msg: impl Into<String>) -> Self {
        LockstepError::ExternalStep(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        LockstepError::Protocol(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        LockstepError::Timeout(msg.into())
    }
}

/// Result type alias for Lockstep operations
pub type Result<T> = std::result::Result<T, LockstepError>;
