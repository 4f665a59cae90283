//! Broker role: matches calls for proposal to providers and relays results.
//!
//! Each call for proposal opens a round keyed by the offer id. A round holds
//! its provider from the moment the offer is priced until the requester
//! decides or the hold window ends, whichever comes first. Rounds for
//! different providers run side by side; rounds competing for the same
//! provider are serialized by the hold.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use capnet_market::{
    Booking, CapabilityRequest, HoldPolicy, MarketError, MatchingEngine, ProviderRecord,
    ProviderRegistry,
};
use capnet_proto::{Inform, JobAssignment, JobId, JobReport, Message, OfferId, PartyId, Proposal};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::party::{Outbound, Party};

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker address.
    pub id: PartyId,
    /// Hold window; also the requester's decision deadline.
    pub hold: HoldPolicy,
}

impl BrokerConfig {
    /// Creates a config with the default hold window.
    pub fn new(id: PartyId) -> Self {
        Self {
            id,
            hold: HoldPolicy::default(),
        }
    }
}

/// Progress of one negotiation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundPhase {
    /// Call for proposal received.
    ReceivedCfp,
    /// Provider held and offer priced.
    Matched,
    /// Offer sent; waiting for accept or reject.
    AwaitingDecision,
    /// Confirmed, released or expired.
    Resolved,
}

impl RoundPhase {
    /// Checks if a transition to the target phase is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        matches!(
            (self, target),
            (Self::ReceivedCfp, Self::Matched)
                | (Self::ReceivedCfp, Self::Resolved)
                | (Self::Matched, Self::AwaitingDecision)
                | (Self::AwaitingDecision, Self::Resolved)
        )
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReceivedCfp => write!(f, "ReceivedCfp"),
            Self::Matched => write!(f, "Matched"),
            Self::AwaitingDecision => write!(f, "AwaitingDecision"),
            Self::Resolved => write!(f, "Resolved"),
        }
    }
}

#[derive(Debug)]
struct Round {
    requester: PartyId,
    booking: Booking,
    phase: RoundPhase,
}

impl Round {
    fn advance(&mut self, to: RoundPhase) {
        debug_assert!(self.phase.can_transition_to(&to), "{} -> {to}", self.phase);
        debug!(offer = %self.booking.offer().id(), from = %self.phase, to = %to, "round advanced");
        self.phase = to;
    }
}

/// A confirmed job awaiting its done report.
#[derive(Debug, Clone)]
struct ConfirmedJob {
    provider: PartyId,
    requester: PartyId,
}

/// Counters over the broker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Calls for proposal received.
    pub cfps: u64,
    /// Calls that found no eligible provider.
    pub no_match: u64,
    /// Offers accepted and turned into jobs.
    pub confirmed: u64,
    /// Offers rejected.
    pub rejected: u64,
    /// Offers whose hold ran out without a decision.
    pub expired: u64,
    /// Completions relayed to requesters.
    pub completed: u64,
}

/// Broker state machine.
pub struct Broker {
    config: BrokerConfig,
    engine: MatchingEngine,
    rounds: HashMap<OfferId, Round>,
    jobs: HashMap<JobId, ConfirmedJob>,
    joined: watch::Sender<BTreeSet<PartyId>>,
    stats: BrokerStats,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.config.id)
            .field("pending_rounds", &self.rounds.len())
            .field("outstanding_jobs", &self.jobs.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Creates a broker matching against `registry`.
    pub fn new(config: BrokerConfig, registry: Arc<dyn ProviderRegistry>) -> Self {
        let engine = MatchingEngine::new(registry, config.hold);
        Self {
            config,
            engine,
            rounds: HashMap::new(),
            jobs: HashMap::new(),
            joined: watch::Sender::new(BTreeSet::new()),
            stats: BrokerStats::default(),
        }
    }

    /// Rounds waiting for a decision.
    pub fn pending_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Phase of an open round.
    pub fn round_phase(&self, offer: &OfferId) -> Option<RoundPhase> {
        self.rounds.get(offer).map(|round| round.phase)
    }

    /// Confirmed jobs whose done report has not arrived.
    pub fn outstanding_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Providers that joined this broker since it was created.
    ///
    /// Records loaded from a persisted registry do not count until their
    /// provider joins again.
    pub fn subscribe_joins(&self) -> watch::Receiver<BTreeSet<PartyId>> {
        self.joined.subscribe()
    }

    /// Lifetime counters.
    pub const fn stats(&self) -> BrokerStats {
        self.stats
    }

    /// The registry the broker matches against.
    pub fn registry(&self) -> &Arc<dyn ProviderRegistry> {
        self.engine.registry()
    }

    fn on_cfp(
        &mut self,
        requester: &PartyId,
        required_units: u64,
        needed_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        self.stats.cfps += 1;
        let request = CapabilityRequest::new(requester.clone(), required_units, needed_by, now);
        debug!(requester = %requester, units = required_units, phase = %RoundPhase::ReceivedCfp, "round opened");

        let booking = match self.engine.match_request(&request, now) {
            Ok(Some(booking)) => booking,
            Ok(None) => {
                self.stats.no_match += 1;
                info!(requester = %requester, units = required_units, "no provider available");
                return Vec::new();
            }
            Err(e) if e.is_already_held() => {
                self.stats.no_match += 1;
                debug!(requester = %requester, error = %e, "lost hold race, abandoning round");
                return Vec::new();
            }
            Err(e) => {
                warn!(requester = %requester, error = %e, "matching failed");
                return Vec::new();
            }
        };

        let proposal = booking.offer().to_proposal();
        let mut round = Round {
            requester: requester.clone(),
            booking,
            phase: RoundPhase::Matched,
        };
        round.advance(RoundPhase::AwaitingDecision);
        self.rounds.insert(proposal.offer_id, round);

        vec![Outbound::new(requester.clone(), Message::Propose(proposal))]
    }

    /// Takes the round a decision refers to, if the decision is still valid.
    fn take_round(&mut self, from: &PartyId, offer: &Proposal, now: DateTime<Utc>) -> Option<Round> {
        let Some(round) = self.rounds.get(&offer.offer_id) else {
            debug!(offer = %offer.offer_id, from = %from, "decision for unknown or closed round");
            return None;
        };
        if &round.requester != from {
            warn!(offer = %offer.offer_id, from = %from, requester = %round.requester, "decision from wrong party");
            return None;
        }
        if round.booking.held_until() <= now {
            // The hold lapsed; the timer path closes the round
            debug!(offer = %offer.offer_id, "decision after hold expired");
            return None;
        }
        self.rounds.remove(&offer.offer_id)
    }

    fn on_accept(&mut self, from: &PartyId, offer: &Proposal, now: DateTime<Utc>) -> Vec<Outbound> {
        let Some(mut round) = self.take_round(from, offer, now) else {
            return Vec::new();
        };
        if let Err(e) = round.booking.confirm(self.engine.ledger(), now) {
            warn!(offer = %offer.offer_id, error = %e, "confirm failed");
            return Vec::new();
        }
        round.advance(RoundPhase::Resolved);
        self.stats.confirmed += 1;

        let booked = round.booking.offer();
        info!(
            offer = %booked.id(),
            provider = %booked.provider_id(),
            requester = %from,
            committed_at = %booked.committed_at(),
            "offer accepted, assigning job"
        );
        let job = JobAssignment {
            job_id: booked.id(),
            required_units: booked.required_units(),
            requester_id: from.clone(),
        };
        self.jobs.insert(
            job.job_id,
            ConfirmedJob {
                provider: booked.provider_id().clone(),
                requester: from.clone(),
            },
        );
        vec![Outbound::new(
            booked.provider_id().clone(),
            Message::Inform(Inform::Job(job)),
        )]
    }

    fn on_reject(&mut self, from: &PartyId, offer: &Proposal, now: DateTime<Utc>) -> Vec<Outbound> {
        let Some(mut round) = self.take_round(from, offer, now) else {
            return Vec::new();
        };
        if let Err(e) = round.booking.release(self.engine.ledger(), now) {
            warn!(offer = %offer.offer_id, error = %e, "release failed");
        }
        round.advance(RoundPhase::Resolved);
        self.stats.rejected += 1;
        info!(offer = %offer.offer_id, requester = %from, "offer rejected, provider released");
        Vec::new()
    }

    fn on_join(
        &mut self,
        provider: &PartyId,
        capacity: u64,
        price_per_unit: f64,
        available_from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let registry = self.engine.registry();
        let mut record = ProviderRecord::new(provider.clone(), capacity, price_per_unit, available_from, now);
        match registry.get(provider) {
            // Re-joining must not cancel a round in progress
            Ok(Some(existing)) => record.held_until = existing.held_until.max(now),
            Ok(None) => {}
            Err(e) => warn!(provider = %provider, error = %e, "registry lookup failed"),
        }
        if let Err(e) = registry.upsert(record) {
            warn!(provider = %provider, error = %e, "failed to register provider");
            return Vec::new();
        }
        self.joined.send_if_modified(|joined| joined.insert(provider.clone()));
        info!(provider = %provider, capacity, price_per_unit, available_from = %available_from, "provider registered");
        vec![Outbound::new(provider.clone(), Message::ack("Registered"))]
    }

    fn on_leave(&mut self, provider: &PartyId) -> Vec<Outbound> {
        let result = self.engine.registry().modify(provider, &mut |record| {
            record.capacity = 0;
            Ok(())
        });
        match result {
            Ok(_) => info!(provider = %provider, "provider left"),
            Err(MarketError::ProviderNotFound(_)) => debug!(provider = %provider, "leave from unknown provider"),
            Err(e) => warn!(provider = %provider, error = %e, "failed to record leave"),
        }
        vec![Outbound::new(provider.clone(), Message::ack("Left"))]
    }

    fn on_done(&mut self, provider: &PartyId, report: JobReport) -> Vec<Outbound> {
        let job_id = report.job.job_id;
        let requester = match self.jobs.entry(job_id) {
            Entry::Occupied(entry) if &entry.get().provider == provider => entry.remove().requester,
            Entry::Occupied(entry) => {
                warn!(provider = %provider, job = %job_id, assigned_to = %entry.get().provider, "done report from wrong provider");
                return Vec::new();
            }
            Entry::Vacant(_) => {
                debug!(provider = %provider, job = %job_id, "done report for unknown job");
                return Vec::new();
            }
        };
        if report.job.requester_id != requester {
            warn!(job = %job_id, reported = %report.job.requester_id, requester = %requester, "done report names another requester");
        }

        if let Err(e) = self
            .engine
            .registry()
            .set_available_from(provider, report.available_from)
        {
            warn!(provider = %provider, error = %e, "failed to update availability");
        }
        self.stats.completed += 1;
        info!(
            provider = %provider,
            job = %job_id,
            requester = %requester,
            "job done, notifying requester"
        );
        vec![Outbound::new(requester, Message::completion(job_id, "Job done!"))]
    }
}

impl Party for Broker {
    fn id(&self) -> &PartyId {
        &self.config.id
    }

    fn on_start(&mut self, _now: DateTime<Utc>) -> Vec<Outbound> {
        info!(broker = %self.config.id, hold_ms = self.config.hold.window.num_milliseconds(), "broker starting");
        Vec::new()
    }

    fn on_message(&mut self, from: &PartyId, message: Message, now: DateTime<Utc>) -> Vec<Outbound> {
        match message {
            Message::Cfp {
                required_units,
                needed_by,
            } => self.on_cfp(from, required_units, needed_by, now),
            Message::AcceptProposal { offer } => self.on_accept(from, &offer, now),
            Message::RejectProposal { offer } => self.on_reject(from, &offer, now),
            Message::Inform(Inform::Join {
                capacity,
                price_per_unit,
                available_from,
            }) => self.on_join(from, capacity, price_per_unit, available_from, now),
            Message::Inform(Inform::Leave) => self.on_leave(from),
            Message::Inform(Inform::Done(report)) => self.on_done(from, report),
            other => {
                debug!(from = %from, label = other.label(), "broker ignoring message");
                Vec::new()
            }
        }
    }

    fn on_timer(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let expired: Vec<OfferId> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.booking.held_until() <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(mut round) = self.rounds.remove(&id) {
                // The hold already lapsed on its own; touching the record could
                // clobber a newer round's hold on the same provider.
                round.advance(RoundPhase::Resolved);
                self.stats.expired += 1;
                info!(
                    offer = %id,
                    provider = %round.booking.offer().provider_id(),
                    requester = %round.requester,
                    "no decision before hold expired"
                );
            }
        }
        Vec::new()
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.rounds.values().map(|round| round.booking.held_until()).min()
    }
}
