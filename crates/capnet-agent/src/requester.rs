//! Requester role: asks for capacity, decides on offers, waits for completion.
//!
//! Phases: `Idle → AwaitingOffer → (decide) → AwaitingCompletion → Idle`.
//! Every wait has a local deadline and every expiry leads back to a fresh
//! call for proposal, so a requester never gets stuck.

use capnet_proto::{Inform, Message, PartyId, Proposal};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::party::{Outbound, Party};

/// Requester settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RequesterConfig {
    /// Requester address.
    pub id: PartyId,
    /// Broker address.
    pub broker: PartyId,
    /// Units per job.
    pub required_units: u64,
    /// Highest acceptable total price.
    pub budget: f64,
    /// How far ahead of the request the provider must be available.
    pub deadline: TimeDelta,
    /// Wait for a proposal before re-requesting.
    pub proposal_timeout: TimeDelta,
    /// Extra wait past the committed completion time.
    pub completion_slack: TimeDelta,
    /// Pause after a rejection before the next call for proposal.
    pub retry_delay: TimeDelta,
    /// Jobs to complete before the requester stops.
    pub jobs: u32,
}

impl RequesterConfig {
    /// Creates a config with the default timing policy.
    pub fn new(id: PartyId, broker: PartyId, required_units: u64, budget: f64) -> Self {
        Self {
            id,
            broker,
            required_units,
            budget,
            deadline: TimeDelta::seconds(10),
            proposal_timeout: TimeDelta::seconds(30),
            completion_slack: TimeDelta::seconds(2),
            retry_delay: TimeDelta::seconds(30),
            jobs: 1,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.required_units == 0 {
            return Err(AgentError::Config(format!(
                "requester {}: required_units must be positive",
                self.id
            )));
        }
        if !self.budget.is_finite() || self.budget < 0.0 {
            return Err(AgentError::Config(format!(
                "requester {}: budget must be a non-negative number",
                self.id
            )));
        }
        if self.proposal_timeout <= TimeDelta::zero() || self.retry_delay <= TimeDelta::zero() {
            return Err(AgentError::Config(format!(
                "requester {}: proposal_timeout and retry_delay must be positive",
                self.id
            )));
        }
        if self.deadline < TimeDelta::zero() || self.completion_slack < TimeDelta::zero() {
            return Err(AgentError::Config(format!(
                "requester {}: deadline and completion_slack must not be negative",
                self.id
            )));
        }
        if self.jobs == 0 {
            return Err(AgentError::Config(format!(
                "requester {}: jobs must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

/// Where the requester is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequesterPhase {
    /// Between cycles; a retry timer may be armed.
    Idle,
    /// Call for proposal sent, waiting for an offer.
    AwaitingOffer,
    /// Offer accepted, waiting for the completion notice.
    AwaitingCompletion,
    /// All configured jobs completed.
    Finished,
}

/// Outcome of evaluating an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Send `accept-proposal`.
    Accept,
    /// Send `reject-proposal`.
    Reject,
}

/// Requester state machine.
#[derive(Debug, Clone)]
pub struct Requester {
    config: RequesterConfig,
    phase: RequesterPhase,
    job_in_flight: bool,
    timer: Option<DateTime<Utc>>,
    current: Option<Proposal>,
    requests_sent: u32,
    completed: u32,
    lost: u32,
}

impl Requester {
    /// Creates an idle requester.
    pub fn new(config: RequesterConfig) -> Self {
        Self {
            config,
            phase: RequesterPhase::Idle,
            job_in_flight: false,
            timer: None,
            current: None,
            requests_sent: 0,
            completed: 0,
            lost: 0,
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> RequesterPhase {
        self.phase
    }

    /// Returns true between an accept and its completion (or loss).
    pub const fn job_in_flight(&self) -> bool {
        self.job_in_flight
    }

    /// The accepted offer being waited on.
    pub const fn current_job(&self) -> Option<&Proposal> {
        self.current.as_ref()
    }

    /// Calls for proposal sent so far.
    pub const fn requests_sent(&self) -> u32 {
        self.requests_sent
    }

    /// Jobs completed so far.
    pub const fn completed(&self) -> u32 {
        self.completed
    }

    /// Jobs given up on after the completion wait expired.
    pub const fn lost(&self) -> u32 {
        self.lost
    }

    /// Settings in use.
    pub const fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// Accept iff the price fits the budget and no job is in flight.
    ///
    /// An offer whose completion wait cannot be timed is rejected.
    pub fn decide(&self, offer: &Proposal) -> Decision {
        if offer.price <= self.config.budget
            && !self.job_in_flight
            && self.completion_deadline(offer).is_some()
        {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }

    fn completion_deadline(&self, offer: &Proposal) -> Option<DateTime<Utc>> {
        offer.committed_at.checked_add_signed(self.config.completion_slack)
    }

    fn request(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        self.phase = RequesterPhase::AwaitingOffer;
        self.timer = Some(now + self.config.proposal_timeout);
        self.requests_sent += 1;
        info!(
            requester = %self.config.id,
            units = self.config.required_units,
            attempt = self.requests_sent,
            "requesting offers"
        );
        vec![Outbound::new(
            self.config.broker.clone(),
            Message::cfp(self.config.required_units, now + self.config.deadline),
        )]
    }

    fn on_offer(&mut self, offer: Proposal, now: DateTime<Utc>) -> Vec<Outbound> {
        match (self.decide(&offer), self.completion_deadline(&offer)) {
            (Decision::Accept, Some(wait_until)) => {
                info!(
                    requester = %self.config.id,
                    provider = %offer.provider_id,
                    price = offer.price,
                    committed_at = %offer.committed_at,
                    "offer accepted"
                );
                self.job_in_flight = true;
                self.phase = RequesterPhase::AwaitingCompletion;
                self.timer = Some(wait_until);
                self.current = Some(offer.clone());
                vec![Outbound::new(
                    self.config.broker.clone(),
                    Message::AcceptProposal { offer },
                )]
            }
            _ => {
                info!(
                    requester = %self.config.id,
                    provider = %offer.provider_id,
                    price = offer.price,
                    budget = self.config.budget,
                    busy = self.job_in_flight,
                    "offer rejected"
                );
                if self.phase == RequesterPhase::AwaitingOffer {
                    self.phase = RequesterPhase::Idle;
                    self.timer = Some(now + self.config.retry_delay);
                }
                vec![Outbound::new(
                    self.config.broker.clone(),
                    Message::RejectProposal { offer },
                )]
            }
        }
    }

    fn on_completion(&mut self, job_id: capnet_proto::JobId, now: DateTime<Utc>) -> Vec<Outbound> {
        let matches_current = self
            .current
            .as_ref()
            .is_some_and(|offer| offer.offer_id == job_id);
        if self.phase != RequesterPhase::AwaitingCompletion || !matches_current {
            debug!(requester = %self.config.id, job = %job_id, "ignoring stale completion");
            return Vec::new();
        }

        self.job_in_flight = false;
        self.current = None;
        self.completed += 1;
        info!(requester = %self.config.id, job = %job_id, completed = self.completed, "job completed");

        if self.completed >= self.config.jobs {
            self.phase = RequesterPhase::Finished;
            self.timer = None;
            return Vec::new();
        }
        self.phase = RequesterPhase::Idle;
        self.request(now)
    }
}

impl Party for Requester {
    fn id(&self) -> &PartyId {
        &self.config.id
    }

    fn on_start(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        self.request(now)
    }

    fn on_message(&mut self, from: &PartyId, message: Message, now: DateTime<Utc>) -> Vec<Outbound> {
        if from != &self.config.broker {
            debug!(requester = %self.config.id, from = %from, "ignoring message from non-broker");
            return Vec::new();
        }
        if self.phase == RequesterPhase::Finished {
            return match message {
                // Still answer offers so the broker releases its hold at once
                Message::Propose(offer) => vec![Outbound::new(
                    self.config.broker.clone(),
                    Message::RejectProposal { offer },
                )],
                _ => Vec::new(),
            };
        }

        match message {
            Message::Propose(offer) => self.on_offer(offer, now),
            Message::Inform(Inform::Completion { job_id, .. }) => self.on_completion(job_id, now),
            other => {
                debug!(requester = %self.config.id, label = other.label(), "ignoring unexpected message");
                Vec::new()
            }
        }
    }

    fn on_timer(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        match self.timer {
            Some(at) if at <= now => {}
            _ => return Vec::new(),
        }
        self.timer = None;

        match self.phase {
            RequesterPhase::AwaitingOffer => {
                warn!(requester = %self.config.id, "no offer before timeout, requesting again");
                self.request(now)
            }
            RequesterPhase::Idle => self.request(now),
            RequesterPhase::AwaitingCompletion => {
                warn!(
                    requester = %self.config.id,
                    job = ?self.current.as_ref().map(|o| o.offer_id),
                    "completion wait expired, treating job as lost"
                );
                self.job_in_flight = false;
                self.current = None;
                self.lost += 1;
                self.phase = RequesterPhase::Idle;
                self.request(now)
            }
            RequesterPhase::Finished => Vec::new(),
        }
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timer
    }

    fn is_finished(&self) -> bool {
        self.phase == RequesterPhase::Finished
    }
}
