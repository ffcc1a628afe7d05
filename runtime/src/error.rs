//! Error taxonomy for the agent runtime (spec §7).
//!
//! One `thiserror` enum covers every failure surface the core exposes:
//! identifier/topic validation, registration, lookup, type mismatch,
//! dispatch, cancellation and the wire boundary. Handler-side errors
//! (the agent's own `on_message` failures) are carried as
//! `RuntimeError::Handler` rather than downcast, since the core treats
//! message content and handler failures as opaque to itself.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("lookup error: {0}")]
    Lookup(String),

    #[error("agent {0} is not accessible from this runtime (remote instance)")]
    NotAccessible(String),

    #[error("type mismatch: expected {expected}, factory produced {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("agent {recipient} has no handler for message type {message_type}")]
    CantHandle {
        recipient: String,
        message_type: String,
    },

    #[error("message undeliverable: {0}")]
    Undeliverable(String),

    #[error("message dropped by intervention handler: {0}")]
    MessageDropped(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("agent handler failed: {0}")]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
