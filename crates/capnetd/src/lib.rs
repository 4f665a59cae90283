//! capnetd - capnet simulation daemon
//!
//! Loads a [`SimulationConfig`] and runs one broker, its providers and its
//! requesters as actors on an in-process network until every requester has
//! finished its jobs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod simulation;

pub use config::SimulationConfig;
pub use error::DaemonError;
pub use simulation::{ProviderSummary, RequesterSummary, Simulation, SimulationReport};
