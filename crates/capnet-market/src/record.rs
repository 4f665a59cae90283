//! Provider records and capability requests.

use capnet_proto::PartyId;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Providers are addressed by their transport identity.
pub type ProviderId = PartyId;

/// Modelled time for `units` of work on a provider of the given capacity.
///
/// Throughput grows with the square root of capacity, so the service time is
/// `units / sqrt(capacity)` seconds, at microsecond resolution.
#[must_use]
pub fn service_time(units: u64, capacity: u64) -> TimeDelta {
    let secs = units as f64 / (capacity.max(1) as f64).sqrt();
    TimeDelta::microseconds((secs * 1_000_000.0).round() as i64)
}

/// A provider's registered capacity, price and booking state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider identity.
    pub id: ProviderId,
    /// Units per interval. Zero once the provider has left.
    pub capacity: u64,
    /// Price charged per unit.
    pub price_per_unit: f64,
    /// Provider is free to start new work at or after this instant.
    pub available_from: DateTime<Utc>,
    /// Exclusivity window of an in-flight negotiation.
    pub held_until: DateTime<Utc>,
}

impl ProviderRecord {
    /// Creates an unheld record.
    #[must_use]
    pub const fn new(
        id: ProviderId,
        capacity: u64,
        price_per_unit: f64,
        available_from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capacity,
            price_per_unit,
            available_from,
            held_until: now,
        }
    }

    /// Returns true while a negotiation round holds this provider.
    #[must_use]
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.held_until > now
    }

    /// Checks capacity and availability, ignoring holds.
    #[must_use]
    pub fn satisfies(&self, required_units: u64, needed_by: DateTime<Utc>) -> bool {
        self.capacity >= required_units && self.available_from <= needed_by
    }

    /// Checks every matching condition, including that no hold is active.
    #[must_use]
    pub fn is_eligible(&self, required_units: u64, needed_by: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.satisfies(required_units, needed_by) && !self.is_held(now)
    }

    /// Total price for `units`.
    #[must_use]
    pub fn quote(&self, units: u64) -> f64 {
        self.price_per_unit * units as f64
    }

    /// Completion instant if `units` were accepted at `now`.
    ///
    /// `None` when the instant falls outside the representable range; such a
    /// provider cannot be offered.
    #[must_use]
    pub fn commitment_for(&self, units: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.available_from
            .max(now)
            .checked_add_signed(service_time(units, self.capacity))
    }
}

/// A requester's call for capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Who is asking.
    pub requester_id: PartyId,
    /// Units of work needed.
    pub required_units: u64,
    /// Latest acceptable provider availability.
    pub needed_by: DateTime<Utc>,
    /// When the broker received the request.
    pub issued_at: DateTime<Utc>,
}

impl CapabilityRequest {
    /// Creates a capability request.
    #[must_use]
    pub const fn new(
        requester_id: PartyId,
        required_units: u64,
        needed_by: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            requester_id,
            required_units,
            needed_by,
            issued_at,
        }
    }
}
