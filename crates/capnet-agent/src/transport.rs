//! Message delivery between parties.
//!
//! The protocol assumes reliable point-to-point delivery with the sender's
//! identity attached. [`InMemoryNetwork`] provides that inside one process;
//! drop rules let tests simulate lost messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use capnet_proto::{Envelope, PartyId};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Errors raised while delivering an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No party is registered under the address.
    #[error("unknown party: {0}")]
    UnknownParty(PartyId),

    /// The receiving party has stopped.
    #[error("party inbox closed: {0}")]
    Closed(PartyId),
}

/// Delivers envelopes to their `to` address.
pub trait Transport: Send + Sync {
    /// Delivers one envelope.
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Predicate selecting envelopes to drop silently.
pub type DropRule = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// In-process transport with one unbounded inbox per party.
#[derive(Default)]
pub struct InMemoryNetwork {
    inboxes: RwLock<HashMap<PartyId, mpsc::UnboundedSender<Envelope>>>,
    drop_rules: RwLock<Vec<DropRule>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("parties", &self.inboxes.read().len())
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl InMemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, id: PartyId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(party = %id, "party registered on network");
        self.inboxes.write().insert(id, tx);
        rx
    }

    /// Removes `id`; later sends to it fail with [`TransportError::UnknownParty`].
    pub fn unregister(&self, id: &PartyId) {
        self.inboxes.write().remove(id);
    }

    /// Drops every future envelope matching `rule`.
    pub fn add_drop_rule(&self, rule: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        self.drop_rules.write().push(Box::new(rule));
    }

    /// Removes all drop rules.
    pub fn clear_drop_rules(&self) {
        self.drop_rules.write().clear();
    }

    /// Envelopes handed to an inbox so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Envelopes discarded by drop rules so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for InMemoryNetwork {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.drop_rules.read().iter().any(|rule| rule(&envelope)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(from = %envelope.from, to = %envelope.to, "envelope dropped by rule");
            return Ok(());
        }

        let inboxes = self.inboxes.read();
        let tx = inboxes
            .get(&envelope.to)
            .ok_or_else(|| TransportError::UnknownParty(envelope.to.clone()))?;

        let to = envelope.to.clone();
        trace!(from = %envelope.from, to = %to, "delivering envelope");
        tx.send(envelope).map_err(|_| TransportError::Closed(to))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
