//! Provider role: registers with the broker and runs assigned jobs.

use capnet_proto::{Inform, JobAssignment, Message, PartyId};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::party::{Outbound, Party};
use crate::scheduler::ProviderScheduler;

/// Provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Provider address.
    pub id: PartyId,
    /// Broker address.
    pub broker: PartyId,
    /// Units per interval.
    pub capacity: u64,
    /// Price charged per unit.
    pub price_per_unit: f64,
    /// First wait for an ack before re-sending the join.
    pub ack_timeout: TimeDelta,
    /// Upper bound for the doubling ack wait.
    pub max_ack_timeout: TimeDelta,
    /// Leave the market this long after starting.
    pub leave_after: Option<TimeDelta>,
}

impl ProviderConfig {
    /// Creates a config with the default ack policy.
    pub fn new(id: PartyId, broker: PartyId, capacity: u64, price_per_unit: f64) -> Self {
        Self {
            id,
            broker,
            capacity,
            price_per_unit,
            ack_timeout: TimeDelta::seconds(2),
            max_ack_timeout: TimeDelta::seconds(30),
            leave_after: None,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.capacity == 0 {
            return Err(AgentError::Config(format!(
                "provider {}: capacity must be positive",
                self.id
            )));
        }
        if !self.price_per_unit.is_finite() || self.price_per_unit <= 0.0 {
            return Err(AgentError::Config(format!(
                "provider {}: price_per_unit must be positive",
                self.id
            )));
        }
        if self.ack_timeout <= TimeDelta::zero() || self.max_ack_timeout < self.ack_timeout {
            return Err(AgentError::Config(format!(
                "provider {}: need 0 < ack_timeout <= max_ack_timeout",
                self.id
            )));
        }
        Ok(())
    }
}

/// Registration state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderPhase {
    /// Not started.
    Unregistered,
    /// Join sent, no ack yet.
    AwaitingAck,
    /// Registered and accepting jobs.
    Ready,
    /// Withdrew from matching; queued jobs still run.
    Left,
}

impl std::fmt::Display for ProviderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unregistered => write!(f, "Unregistered"),
            Self::AwaitingAck => write!(f, "AwaitingAck"),
            Self::Ready => write!(f, "Ready"),
            Self::Left => write!(f, "Left"),
        }
    }
}

/// Provider state machine.
#[derive(Debug, Clone)]
pub struct Provider {
    config: ProviderConfig,
    phase: ProviderPhase,
    scheduler: ProviderScheduler,
    ack_wait: TimeDelta,
    ack_deadline: Option<DateTime<Utc>>,
    leave_at: Option<DateTime<Utc>>,
    joins_sent: u32,
    jobs_done: u32,
}

impl Provider {
    /// Creates an unregistered provider.
    pub fn new(config: ProviderConfig) -> Self {
        let scheduler = ProviderScheduler::new(config.capacity, DateTime::<Utc>::MIN_UTC);
        let ack_wait = config.ack_timeout;
        Self {
            config,
            phase: ProviderPhase::Unregistered,
            scheduler,
            ack_wait,
            ack_deadline: None,
            leave_at: None,
            joins_sent: 0,
            jobs_done: 0,
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> ProviderPhase {
        self.phase
    }

    /// Job queue and commitment cursor.
    pub const fn scheduler(&self) -> &ProviderScheduler {
        &self.scheduler
    }

    /// Join messages sent so far, including retries.
    pub const fn joins_sent(&self) -> u32 {
        self.joins_sent
    }

    /// Jobs reported done so far.
    pub const fn jobs_done(&self) -> u32 {
        self.jobs_done
    }

    /// Current ack wait; doubles on each miss.
    pub const fn ack_wait(&self) -> TimeDelta {
        self.ack_wait
    }

    /// Settings in use.
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Withdraws from matching. Queued jobs still complete and are reported.
    pub fn leave(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        if self.phase == ProviderPhase::Left {
            return Vec::new();
        }
        info!(provider = %self.config.id, queued = self.scheduler.len(), at = %now, "leaving market");
        self.phase = ProviderPhase::Left;
        self.ack_deadline = None;
        self.leave_at = None;
        vec![Outbound::new(self.config.broker.clone(), Message::Inform(Inform::Leave))]
    }

    fn join(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let available_from = self.scheduler.current_commitment().max(now);
        self.phase = ProviderPhase::AwaitingAck;
        self.ack_deadline = Some(now + self.ack_wait);
        self.joins_sent += 1;
        debug!(
            provider = %self.config.id,
            attempt = self.joins_sent,
            available_from = %available_from,
            "sending join"
        );
        vec![Outbound::new(
            self.config.broker.clone(),
            Message::join(self.config.capacity, self.config.price_per_unit, available_from),
        )]
    }

    fn registered(&mut self) {
        self.phase = ProviderPhase::Ready;
        self.ack_deadline = None;
        self.ack_wait = self.config.ack_timeout;
    }

    fn on_job(&mut self, job: JobAssignment, now: DateTime<Utc>) {
        if self.phase == ProviderPhase::AwaitingAck {
            debug!(provider = %self.config.id, "job received before ack, treating as registered");
            self.registered();
        }
        let job_id = job.job_id;
        let units = job.required_units;
        let Some(completes_at) = self.scheduler.enqueue(job, now) else {
            warn!(provider = %self.config.id, job = %job_id, units, "job completion out of range, dropping");
            return;
        };
        info!(
            provider = %self.config.id,
            job = %job_id,
            units,
            completes_at = %completes_at,
            queued = self.scheduler.len(),
            "job accepted"
        );
    }

    fn report_due(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        self.scheduler
            .fire_due(now)
            .into_iter()
            .map(|report| {
                self.jobs_done += 1;
                info!(
                    provider = %self.config.id,
                    job = %report.job.job_id,
                    available_from = %report.available_from,
                    "job done"
                );
                Outbound::new(self.config.broker.clone(), Message::Inform(Inform::Done(report)))
            })
            .collect()
    }
}

impl Party for Provider {
    fn id(&self) -> &PartyId {
        &self.config.id
    }

    fn on_start(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        info!(
            provider = %self.config.id,
            capacity = self.config.capacity,
            price_per_unit = self.config.price_per_unit,
            "provider starting"
        );
        self.leave_at = self.config.leave_after.map(|after| now + after);
        self.join(now)
    }

    fn on_message(&mut self, from: &PartyId, message: Message, now: DateTime<Utc>) -> Vec<Outbound> {
        if from != &self.config.broker {
            debug!(provider = %self.config.id, from = %from, "ignoring message from non-broker");
            return Vec::new();
        }

        match message {
            Message::Inform(Inform::Ack { text }) => {
                if self.phase == ProviderPhase::AwaitingAck {
                    info!(provider = %self.config.id, ack = %text, "registered with broker");
                    self.registered();
                } else {
                    debug!(provider = %self.config.id, phase = %self.phase, "ignoring ack");
                }
                Vec::new()
            }
            Message::Inform(Inform::Job(job)) => {
                if self.phase == ProviderPhase::Unregistered {
                    warn!(provider = %self.config.id, job = %job.job_id, "job before start, ignoring");
                    return Vec::new();
                }
                self.on_job(job, now);
                // A zero-length job on an idle provider is already due
                self.report_due(now)
            }
            other => {
                debug!(provider = %self.config.id, label = other.label(), "ignoring unexpected message");
                Vec::new()
            }
        }
    }

    fn on_timer(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = self.report_due(now);

        if self.leave_at.is_some_and(|at| at <= now) {
            out.extend(self.leave(now));
        }

        if self.phase == ProviderPhase::AwaitingAck && self.ack_deadline.is_some_and(|at| at <= now) {
            let doubled = self.ack_wait * 2;
            self.ack_wait = doubled.min(self.config.max_ack_timeout);
            warn!(
                provider = %self.config.id,
                next_wait_ms = self.ack_wait.num_milliseconds(),
                "no ack from broker, re-sending join"
            );
            out.extend(self.join(now));
        }

        out
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [self.ack_deadline, self.leave_at, self.scheduler.next_completion()]
            .into_iter()
            .flatten()
            .min()
    }

    fn is_finished(&self) -> bool {
        self.phase == ProviderPhase::Left && self.scheduler.is_empty()
    }
}
