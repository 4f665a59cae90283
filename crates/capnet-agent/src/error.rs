//! Error types for capnet-agent.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur in agent operations.
///
/// None of these stop a party; the driver logs them and keeps running.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Message could not be delivered.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Proto(#[from] capnet_proto::ProtoError),

    /// Registry or booking failure.
    #[error("market error: {0}")]
    Market(#[from] capnet_market::MarketError),

    /// Invalid role configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
