//! Wall-clock time for parties.
//!
//! Protocol state is expressed in `DateTime<Utc>`, while the driver sleeps on
//! tokio instants. [`TokioClock`] ties the two together so that paused-time
//! tests advance both at once.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use tokio::time::Instant;

// Stand-in for deadlines too far out to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Source of the current time and of sleep targets.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Runtime instant corresponding to `at`. Past times map to now.
    fn instant_at(&self, at: DateTime<Utc>) -> Instant;
}

/// Wall time derived from the tokio clock.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl TokioClock {
    /// Anchors the clock at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchors the clock so that the current tokio instant reads as `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_wall + TimeDelta::from_std(elapsed).unwrap_or_else(|_| TimeDelta::zero())
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.anchor_wall).to_std() {
            Ok(offset) => self
                .anchor_instant
                .checked_add(offset)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            Err(_) => Instant::now(),
        }
    }
}
