use thiserror::Error;

use crate::flow::FlowStatus;

#[derive(Debug, Error)]
pub enum FlowError {
    // Flow lookup / state machine errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: FlowStatus, to: FlowStatus },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    // Step execution errors
    #[error("Step failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Step dependency unsatisfied: {step} requires {dependency}")]
    DependencyUnsatisfied { step: String, dependency: String },

    #[error("No handler registered for step: {0}")]
    HandlerNotFound(String),

    // Payment domain errors
    #[error("Allocation percentages sum to {total}, expected 100")]
    InvalidAllocation { total: f64 },

    #[error("Exchange error: {0}")]
    Exchange(String),

    // Recovery errors
    #[error("Recovery failed: {0}")]
    Recovery(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
