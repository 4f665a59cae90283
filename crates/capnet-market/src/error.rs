//! Error types for capnet-market.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::ProviderId;

/// Errors that can occur in registry, matching and booking operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketError {
    /// No record exists for the provider.
    #[error("provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// Another negotiation round holds the provider.
    #[error("provider {provider} already held until {until}")]
    AlreadyHeld {
        /// The contended provider.
        provider: ProviderId,
        /// End of the competing hold.
        until: DateTime<Utc>,
    },

    /// The capability request cannot be matched as stated.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid booking state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// A computed instant falls outside the representable range.
    #[error("time out of range: {0}")]
    TimeOutOfRange(String),

    /// Backing store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    /// Returns true for a lost race on a provider hold.
    #[must_use]
    pub const fn is_already_held(&self) -> bool {
        matches!(self, Self::AlreadyHeld { .. })
    }
}
