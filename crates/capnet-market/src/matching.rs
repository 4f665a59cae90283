//! Matching engine.
//!
//! Connects a capability request with the cheapest eligible provider and
//! reserves that provider before the offer leaves the broker.

use std::sync::Arc;

use capnet_proto::{OfferId, PartyId, Proposal};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::booking::{Booking, BookingLedger, HoldPolicy};
use crate::error::MarketError;
use crate::record::{CapabilityRequest, ProviderId, ProviderRecord};
use crate::registry::ProviderRegistry;

/// A priced, time-committed offer for one request. Immutable once issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    id: OfferId,
    provider_id: ProviderId,
    requester_id: PartyId,
    required_units: u64,
    price: f64,
    committed_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl Offer {
    /// Prices `request` against `record` at `now`.
    ///
    /// `price = price_per_unit * required_units` and
    /// `committed_at = max(available_from, now) + required_units / sqrt(capacity)`.
    /// Returns `None` if `committed_at` is out of range.
    #[must_use]
    pub fn compute(
        record: &ProviderRecord,
        request: &CapabilityRequest,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let committed_at = record.commitment_for(request.required_units, now)?;
        Some(Self {
            id: OfferId::new(),
            provider_id: record.id.clone(),
            requester_id: request.requester_id.clone(),
            required_units: request.required_units,
            price: record.quote(request.required_units),
            committed_at,
            issued_at: now,
        })
    }

    /// Offer identifier.
    #[must_use]
    pub const fn id(&self) -> OfferId {
        self.id
    }

    /// Provider the offer is for.
    #[must_use]
    pub const fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Requester the offer is for.
    #[must_use]
    pub const fn requester_id(&self) -> &PartyId {
        &self.requester_id
    }

    /// Units of work.
    #[must_use]
    pub const fn required_units(&self) -> u64 {
        self.required_units
    }

    /// Total price.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.price
    }

    /// Completion instant the provider commits to.
    #[must_use]
    pub const fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    /// When the offer was issued.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Wire form sent to the requester.
    #[must_use]
    pub fn to_proposal(&self) -> Proposal {
        Proposal {
            offer_id: self.id,
            provider_id: self.provider_id.clone(),
            price: self.price,
            required_units: self.required_units,
            committed_at: self.committed_at,
        }
    }
}

/// Selects providers for capability requests.
#[derive(Clone)]
pub struct MatchingEngine {
    registry: Arc<dyn ProviderRegistry>,
    ledger: BookingLedger,
}

impl std::fmt::Debug for MatchingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingEngine")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl MatchingEngine {
    /// Creates an engine whose ledger shares `registry`.
    pub fn new(registry: Arc<dyn ProviderRegistry>, policy: HoldPolicy) -> Self {
        let ledger = BookingLedger::new(Arc::clone(&registry), policy);
        Self { registry, ledger }
    }

    /// The ledger used for holds; the broker confirms and releases through it.
    pub const fn ledger(&self) -> &BookingLedger {
        &self.ledger
    }

    /// The registry matched against.
    pub fn registry(&self) -> &Arc<dyn ProviderRegistry> {
        &self.registry
    }

    /// Finds the cheapest eligible provider and holds it.
    ///
    /// Providers whose commitment would fall past the end of representable
    /// time are skipped. Returns `Ok(None)` when nobody qualifies; the caller should not retry
    /// on the same tick. A lost hold race surfaces as
    /// [`MarketError::AlreadyHeld`] and the attempt should be abandoned.
    pub fn match_request(
        &self,
        request: &CapabilityRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, MarketError> {
        if request.required_units == 0 {
            return Err(MarketError::InvalidRequest(
                "required_units must be positive".to_string(),
            ));
        }

        let candidates =
            self.registry
                .query_eligible(request.required_units, request.needed_by, now)?;
        let Some(best) = candidates
            .into_iter()
            .find(|r| r.commitment_for(request.required_units, now).is_some())
        else {
            debug!(
                requester = %request.requester_id,
                units = request.required_units,
                "no provider satisfies request"
            );
            return Ok(None);
        };

        let held = self.ledger.hold(&best.id, now)?;

        // The record may have moved between query and hold
        if !held.satisfies(request.required_units, request.needed_by) {
            self.ledger.release(&held.id, now)?;
            debug!(provider = %held.id, "provider no longer satisfies request after hold");
            return Ok(None);
        }

        let Some(offer) = Offer::compute(&held, request, now) else {
            self.ledger.release(&held.id, now)?;
            debug!(provider = %held.id, "commitment out of range after hold");
            return Ok(None);
        };
        info!(
            offer = %offer.id(),
            provider = %held.id,
            requester = %request.requester_id,
            price = offer.price(),
            committed_at = %offer.committed_at(),
            "offer issued"
        );
        Ok(Some(Booking::held(held, offer)))
    }
}
