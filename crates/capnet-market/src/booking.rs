//! Booking lifecycle on provider records.
//!
//! A booking starts `Held` when the matching engine issues an offer and ends
//! `Confirmed` (the requester accepted) or `Released` (rejected or timed out).
//! The ledger is the only writer of `held_until` and, together with the
//! completion report, of `available_from`.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MarketError;
use crate::matching::Offer;
use crate::record::{ProviderId, ProviderRecord};
use crate::registry::ProviderRegistry;

/// How long a provider stays reserved for one outstanding proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldPolicy {
    /// Length of the exclusivity window.
    pub window: TimeDelta,
}

impl HoldPolicy {
    /// Creates a policy with a window of `secs` seconds.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self {
            window: TimeDelta::seconds(secs),
        }
    }
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self::from_secs(10)
    }
}

/// The state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingState {
    /// Provider reserved while the requester decides.
    Held,
    /// Requester accepted; provider committed until the offer's completion time.
    Confirmed,
    /// Requester declined or never answered.
    Released,
}

impl BookingState {
    /// Checks if a transition to the target state is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        matches!(
            (self, target),
            (Self::Held, Self::Confirmed) | (Self::Held, Self::Released)
        )
    }
}

impl std::fmt::Display for BookingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Held => write!(f, "Held"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Released => write!(f, "Released"),
        }
    }
}

/// Association of a held provider with the offer issued against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    record: ProviderRecord,
    offer: Offer,
    state: BookingState,
}

impl Booking {
    /// Creates a booking in the `Held` state.
    #[must_use]
    pub const fn held(record: ProviderRecord, offer: Offer) -> Self {
        Self {
            record,
            offer,
            state: BookingState::Held,
        }
    }

    /// Provider record as of the hold.
    #[must_use]
    pub const fn record(&self) -> &ProviderRecord {
        &self.record
    }

    /// The offer this booking backs.
    #[must_use]
    pub const fn offer(&self) -> &Offer {
        &self.offer
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BookingState {
        self.state
    }

    /// End of the hold taken for this booking.
    #[must_use]
    pub const fn held_until(&self) -> DateTime<Utc> {
        self.record.held_until
    }

    fn check_transition(&self, target: BookingState) -> Result<(), MarketError> {
        if self.state.can_transition_to(&target) {
            Ok(())
        } else {
            Err(MarketError::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Confirms the booking: the provider is committed until the offer's completion time.
    pub fn confirm(&mut self, ledger: &BookingLedger, now: DateTime<Utc>) -> Result<(), MarketError> {
        self.check_transition(BookingState::Confirmed)?;
        self.record = ledger.confirm(&self.record.id, self.offer.committed_at(), now)?;
        self.state = BookingState::Confirmed;
        Ok(())
    }

    /// Releases the booking, leaving the provider's commitments unchanged.
    pub fn release(&mut self, ledger: &BookingLedger, now: DateTime<Utc>) -> Result<(), MarketError> {
        self.check_transition(BookingState::Released)?;
        self.record = ledger.release(&self.record.id, now)?;
        self.state = BookingState::Released;
        Ok(())
    }

    /// Returns true once the booking is confirmed or released.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self.state, BookingState::Confirmed | BookingState::Released)
    }
}

/// Applies hold, confirm and release to the registry.
#[derive(Clone)]
pub struct BookingLedger {
    registry: Arc<dyn ProviderRegistry>,
    policy: HoldPolicy,
}

impl std::fmt::Debug for BookingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingLedger")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BookingLedger {
    /// Creates a ledger over `registry`.
    pub fn new(registry: Arc<dyn ProviderRegistry>, policy: HoldPolicy) -> Self {
        Self { registry, policy }
    }

    /// The configured hold policy.
    pub const fn policy(&self) -> HoldPolicy {
        self.policy
    }

    /// Holds the provider for the policy window.
    pub fn hold(&self, id: &ProviderId, now: DateTime<Utc>) -> Result<ProviderRecord, MarketError> {
        self.hold_for(id, self.policy.window, now)
    }

    /// Holds the provider until `now + window`.
    ///
    /// Fails with [`MarketError::AlreadyHeld`] if a hold is still active; the
    /// check runs inside the atomic update so two racing rounds cannot both win.
    pub fn hold_for(
        &self,
        id: &ProviderId,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<ProviderRecord, MarketError> {
        let until = now
            .checked_add_signed(window)
            .ok_or_else(|| MarketError::TimeOutOfRange(format!("hold of {window} from {now}")))?;
        let record = self.registry.modify(id, &mut |record| {
            if record.is_held(now) {
                return Err(MarketError::AlreadyHeld {
                    provider: record.id.clone(),
                    until: record.held_until,
                });
            }
            record.held_until = until;
            Ok(())
        })?;
        debug!(provider = %id, until = %record.held_until, "provider held");
        Ok(record)
    }

    /// Ends the hold and commits the provider until `committed_at`.
    pub fn confirm(
        &self,
        id: &ProviderId,
        committed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ProviderRecord, MarketError> {
        let record = self.registry.modify(id, &mut |record| {
            record.held_until = now;
            record.available_from = committed_at;
            Ok(())
        })?;
        debug!(provider = %id, available_from = %committed_at, "booking confirmed");
        Ok(record)
    }

    /// Ends the hold without touching `available_from`.
    pub fn release(&self, id: &ProviderId, now: DateTime<Utc>) -> Result<ProviderRecord, MarketError> {
        let record = self.registry.set_held(id, now)?;
        debug!(provider = %id, "booking released");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CapabilityRequest;
    use crate::registry::InMemoryRegistry;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryRegistry>, BookingLedger) {
        let registry = Arc::new(InMemoryRegistry::with_records([ProviderRecord::new(
            "p1".into(),
            100,
            1.0,
            t0(),
            t0(),
        )]));
        let ledger = BookingLedger::new(registry.clone(), HoldPolicy::default());
        (registry, ledger)
    }

    fn held_booking(ledger: &BookingLedger) -> Booking {
        let record = ledger.hold(&"p1".into(), t0()).unwrap();
        let request =
            CapabilityRequest::new("r1".into(), 20, t0() + TimeDelta::seconds(5), t0());
        let offer = Offer::compute(&record, &request, t0()).unwrap();
        Booking::held(record, offer)
    }

    #[test]
    fn booking_state_transitions() {
        assert!(BookingState::Held.can_transition_to(&BookingState::Confirmed));
        assert!(BookingState::Held.can_transition_to(&BookingState::Released));

        assert!(!BookingState::Confirmed.can_transition_to(&BookingState::Released));
        assert!(!BookingState::Released.can_transition_to(&BookingState::Confirmed));
        assert!(!BookingState::Released.can_transition_to(&BookingState::Held));
    }

    #[test]
    fn hold_sets_window_from_policy() {
        let (_, ledger) = setup();
        let record = ledger.hold(&"p1".into(), t0()).unwrap();
        assert_eq!(record.held_until, t0() + TimeDelta::seconds(10));
    }

    #[test]
    fn second_hold_fails_while_first_is_active() {
        let (_, ledger) = setup();
        ledger.hold(&"p1".into(), t0()).unwrap();

        let err = ledger
            .hold(&"p1".into(), t0() + TimeDelta::seconds(9))
            .unwrap_err();
        assert!(err.is_already_held());
    }

    #[test]
    fn hold_expires_on_its_own() {
        let (_, ledger) = setup();
        ledger.hold(&"p1".into(), t0()).unwrap();
        assert!(ledger.hold(&"p1".into(), t0() + TimeDelta::seconds(10)).is_ok());
    }

    #[test]
    fn confirm_commits_provider_to_offer_completion() {
        let (registry, ledger) = setup();
        let mut booking = held_booking(&ledger);
        let now = t0() + TimeDelta::seconds(1);

        booking.confirm(&ledger, now).unwrap();

        let stored = registry.get(&"p1".into()).unwrap().unwrap();
        assert_eq!(booking.state(), BookingState::Confirmed);
        assert_eq!(stored.available_from, booking.offer().committed_at());
        assert_eq!(stored.held_until, now);
        assert!(!stored.is_held(now));
    }

    #[test]
    fn release_leaves_availability_unchanged() {
        let (registry, ledger) = setup();
        let mut booking = held_booking(&ledger);
        let now = t0() + TimeDelta::seconds(1);

        booking.release(&ledger, now).unwrap();

        let stored = registry.get(&"p1".into()).unwrap().unwrap();
        assert_eq!(booking.state(), BookingState::Released);
        assert_eq!(stored.available_from, t0());
        assert_eq!(stored.held_until, now);
    }

    #[test]
    fn resolved_booking_cannot_transition_again() {
        let (_, ledger) = setup();
        let mut booking = held_booking(&ledger);
        booking.release(&ledger, t0()).unwrap();

        let err = booking.confirm(&ledger, t0()).unwrap_err();
        assert!(matches!(err, MarketError::InvalidStateTransition { .. }));
        assert!(booking.is_resolved());
    }

    #[test]
    fn racing_holds_have_exactly_one_winner() {
        const THREADS: usize = 8;
        let (registry, ledger) = setup();
        let barrier = std::sync::Barrier::new(THREADS);

        let results: Vec<Result<ProviderRecord, MarketError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        ledger.hold(&"p1".into(), t0())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(MarketError::is_already_held)
        );
        let stored = registry.get(&"p1".into()).unwrap().unwrap();
        assert_eq!(stored.held_until, t0() + TimeDelta::seconds(10));
    }

    #[test]
    fn hold_window_past_the_end_of_time_fails() {
        let (registry, ledger) = setup();
        let err = ledger
            .hold_for(&"p1".into(), TimeDelta::MAX, t0())
            .unwrap_err();
        assert!(matches!(err, MarketError::TimeOutOfRange(_)));
        assert!(!registry.get(&"p1".into()).unwrap().unwrap().is_held(t0()));
    }
}
