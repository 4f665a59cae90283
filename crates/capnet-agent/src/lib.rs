//! # capnet-agent
//!
//! The three capnet roles and the machinery that runs them.
//!
//! This crate provides:
//!
//! - **Requester**: [`Requester`] asks for capacity, decides on offers and
//!   recovers lost jobs
//! - **Broker**: [`Broker`] matches requests, holds providers and relays completions
//! - **Provider**: [`Provider`] registers with the broker and works through its
//!   [`ProviderScheduler`]
//! - **Driver**: [`run_party`] runs any [`Party`] as a single-task actor fed by
//!   one inbox, over any [`Transport`]
//!
//! Each role is a plain state machine: handlers take the current time and
//! return the messages to send, so the protocol can be tested without a runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod clock;
pub mod error;
pub mod party;
pub mod provider;
pub mod requester;
pub mod scheduler;
pub mod transport;

pub use error::AgentError;

pub use broker::{Broker, BrokerConfig, BrokerStats, RoundPhase};
pub use clock::{Clock, TokioClock};
pub use party::{run_party, Outbound, Party};
pub use provider::{Provider, ProviderConfig, ProviderPhase};
pub use requester::{Decision, Requester, RequesterConfig, RequesterPhase};
pub use scheduler::{ProviderScheduler, ScheduledJob};
pub use transport::{DropRule, InMemoryNetwork, Transport, TransportError};
