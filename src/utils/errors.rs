// src/utils/errors.rs
//! Crate-wide error type and result alias.

use thiserror::Error;

/// Errors produced by environments, managers and the RPC layer
#[derive(Debug, Error)]
pub enum AgoraError {
    /// Address string did not match `tcp://host:port/index`
    #[error("invalid address '{0}'")]
    InvalidAddr(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Connect or call deadline expired
    #[error("timed out talking to {0}")]
    Timeout(String),

    /// The peer closed the connection before answering
    #[error("connection to {0} closed before a response arrived")]
    ConnectionClosed(String),

    /// The peer answered with an error payload
    #[error("remote error from {addr}: {message}")]
    Remote { addr: String, message: String },

    #[error("no agent at address {0}")]
    UnknownAgent(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// Agent type name was never registered with the [`AgentRegistry`]
    ///
    /// [`AgentRegistry`]: crate::agent::registry::AgentRegistry
    #[error("unknown agent type '{0}'")]
    UnknownAgentType(String),

    /// RPC addressed the manager slot of an environment without a manager
    #[error("environment has no manager")]
    NoManager,

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Multi-environment operation with no slaves attached
    #[error("no slave environments attached")]
    NoSlaves,

    /// `step` was called while agents from the previous step are pending
    #[error("previous simulation step has not finished")]
    StepInProgress,

    /// Operation on an environment that was already destroyed
    #[error("environment is closed")]
    EnvironmentClosed,
}

/// Result type alias using [`AgoraError`]
pub type Result<T> = std::result::Result<T, AgoraError>;
