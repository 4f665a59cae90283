//! # capnet-market
//!
//! Broker-side market state for capnet.
//!
//! This crate provides:
//!
//! - [`ProviderRegistry`]: the keyed store of provider capacity, price,
//!   availability and hold state, with an in-memory and a JSON-snapshot backend
//! - [`MatchingEngine`]: picks the cheapest eligible, unheld provider and prices an [`Offer`]
//! - [`BookingLedger`]: the hold/confirm/release transitions on a provider record
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeDelta, Utc};
//! use capnet_market::{CapabilityRequest, HoldPolicy, InMemoryRegistry, MatchingEngine, ProviderRecord, ProviderRegistry};
//!
//! let now = Utc::now();
//! let registry = Arc::new(InMemoryRegistry::new());
//! registry.upsert(ProviderRecord::new("provider-1".into(), 100, 1.0, now, now)).unwrap();
//!
//! let engine = MatchingEngine::new(registry, HoldPolicy::default());
//! let request = CapabilityRequest::new("requester-1".into(), 20, now + TimeDelta::seconds(5), now);
//! let booking = engine.match_request(&request, now).unwrap().unwrap();
//!
//! assert_eq!(booking.offer().price(), 20.0);
//! assert_eq!(booking.offer().committed_at(), now + TimeDelta::seconds(2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod booking;
pub mod error;
pub mod matching;
pub mod record;
pub mod registry;
pub mod store;

pub use booking::{Booking, BookingLedger, BookingState, HoldPolicy};
pub use error::MarketError;
pub use matching::{MatchingEngine, Offer};
pub use record::{service_time, CapabilityRequest, ProviderId, ProviderRecord};
pub use registry::{InMemoryRegistry, ProviderRegistry};
pub use store::JsonFileRegistry;
