//! Error types for capnetd.

use thiserror::Error;

/// Errors that can occur while loading or running a simulation.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent error.
    #[error("agent error: {0}")]
    Agent(#[from] capnet_agent::AgentError),

    /// A party task panicked or was cancelled.
    #[error("party task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
