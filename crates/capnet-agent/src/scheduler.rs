//! Provider job queue and completion timing.
//!
//! A provider's capacity is one shared throughput resource: accepted jobs run
//! back to back in arrival order. `current_commitment` is the provider's
//! single "busy until" cursor, and only the head job's completion needs a
//! timer because completion times never decrease along the queue.

use std::collections::VecDeque;

use capnet_market::service_time;
use capnet_proto::{JobAssignment, JobReport, JobStatus};
use chrono::{DateTime, Utc};

/// A job accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    /// The broker's assignment.
    pub assignment: JobAssignment,
    /// Modelled completion instant.
    pub completes_at: DateTime<Utc>,
}

/// FIFO queue of accepted jobs for one provider.
#[derive(Debug, Clone)]
pub struct ProviderScheduler {
    capacity: u64,
    current_commitment: DateTime<Utc>,
    queue: VecDeque<ScheduledJob>,
}

impl ProviderScheduler {
    /// Creates an empty scheduler whose cursor starts at `available_from`.
    pub fn new(capacity: u64, available_from: DateTime<Utc>) -> Self {
        Self {
            capacity,
            current_commitment: available_from,
            queue: VecDeque::new(),
        }
    }

    /// Queues a job and returns its completion instant.
    ///
    /// `completion = max(now, current_commitment) + units / sqrt(capacity)`.
    /// A job whose completion would be out of range is not queued and `None`
    /// is returned.
    pub fn enqueue(&mut self, assignment: JobAssignment, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let completes_at = self
            .current_commitment
            .max(now)
            .checked_add_signed(service_time(assignment.required_units, self.capacity))?;
        self.current_commitment = completes_at;
        self.queue.push_back(ScheduledJob {
            assignment,
            completes_at,
        });
        Some(completes_at)
    }

    /// Completion instant of the head job; the one timer the provider arms.
    pub fn next_completion(&self) -> Option<DateTime<Utc>> {
        self.queue.front().map(|job| job.completes_at)
    }

    /// Pops the head job if it is due and reports it done.
    pub fn fire(&mut self, now: DateTime<Utc>) -> Option<JobReport> {
        if self.next_completion()? > now {
            return None;
        }
        let job = self.queue.pop_front()?;
        Some(JobReport {
            job: job.assignment,
            status: JobStatus::Done,
            available_from: self.current_commitment,
        })
    }

    /// Reports every job due at `now`, in queue order.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> Vec<JobReport> {
        std::iter::from_fn(|| self.fire(now)).collect()
    }

    /// Instant after which the provider is free of all accepted work.
    pub const fn current_commitment(&self) -> DateTime<Utc> {
        self.current_commitment
    }

    /// Provider capacity used for service times.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Jobs still queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no job is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued jobs, head first.
    pub fn jobs(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.queue.iter()
    }
}
