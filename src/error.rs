//! TaskPilot error types

use crate::agent::state::{AgentState, TransitionTrigger};
use thiserror::Error;

/// TaskPilot error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle transition outside the allow-list
    #[error("Invalid transition: {from} -> {to} ({trigger})")]
    InvalidTransition {
        from: AgentState,
        to: AgentState,
        trigger: TransitionTrigger,
    },

    /// Plan operation that breaks phase ordering
    #[error("Invalid plan operation: {0}")]
    InvalidPlan(String),

    /// Tool call recorded while the task is not executing
    #[error("Tool calls are only accepted while executing, task is {0}")]
    NotExecuting(AgentState),

    /// Orchestrator was used after a fatal transition error or failure
    #[error("Task {0} is spent and cannot accept further operations")]
    TaskSpent(String),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Session persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for TaskPilot operations
pub type Result<T> = std::result::Result<T, Error>;
