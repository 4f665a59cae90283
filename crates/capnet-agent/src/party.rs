//! Party handler trait and the actor loop that drives it.
//!
//! A party owns all of its state and runs on a single task. It suspends only
//! while waiting for its next message or its next deadline, so its handlers
//! never run concurrently with each other.

use std::sync::Arc;

use capnet_proto::{Envelope, Message, PartyId};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::AgentError;
use crate::transport::Transport;

/// A message a handler wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Recipient.
    pub to: PartyId,
    /// Message body.
    pub message: Message,
}

impl Outbound {
    /// Creates an outbound message.
    pub fn new(to: PartyId, message: Message) -> Self {
        Self { to, message }
    }
}

/// Handlers for one protocol role.
pub trait Party: Send {
    /// Address of this party.
    fn id(&self) -> &PartyId;

    /// Runs once before the first message.
    fn on_start(&mut self, now: DateTime<Utc>) -> Vec<Outbound>;

    /// Handles a decoded message from `from`.
    fn on_message(&mut self, from: &PartyId, message: Message, now: DateTime<Utc>) -> Vec<Outbound>;

    /// Handles every timer due at `now`.
    fn on_timer(&mut self, now: DateTime<Utc>) -> Vec<Outbound>;

    /// Earliest pending timer, if any.
    fn next_deadline(&self) -> Option<DateTime<Utc>>;

    /// Returns true once the party has nothing left to do.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Runs `party` until it finishes, its inbox closes or `shutdown` fires.
///
/// Malformed messages and delivery failures are logged and skipped. Returns
/// the party so callers can inspect its final state.
pub async fn run_party<P, T, C>(
    mut party: P,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    transport: Arc<T>,
    clock: C,
    shutdown: CancellationToken,
) -> P
where
    P: Party,
    T: Transport + ?Sized,
    C: Clock,
{
    info!(party = %party.id(), "party started");
    let out = party.on_start(clock.now());
    dispatch(party.id(), out, transport.as_ref());

    loop {
        if party.is_finished() {
            info!(party = %party.id(), "party finished");
            break;
        }

        let deadline = party.next_deadline().map(|at| clock.instant_at(at));

        tokio::select! {
            () = shutdown.cancelled() => {
                info!(party = %party.id(), "party shutting down");
                break;
            }
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else {
                    debug!(party = %party.id(), "inbox closed");
                    break;
                };
                match envelope.open() {
                    Ok(message) => {
                        debug!(party = %party.id(), from = %envelope.from, label = message.label(), "received");
                        let out = party.on_message(&envelope.from, message, clock.now());
                        dispatch(party.id(), out, transport.as_ref());
                    }
                    Err(e) => {
                        debug!(party = %party.id(), from = %envelope.from, error = %e, "dropping malformed message");
                    }
                }
            }
            () = sleep_until(deadline) => {
                let out = party.on_timer(clock.now());
                dispatch(party.id(), out, transport.as_ref());
            }
        }
    }

    party
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn dispatch<T: Transport + ?Sized>(from: &PartyId, out: Vec<Outbound>, transport: &T) {
    for outbound in out {
        let label = outbound.message.label();
        let to = outbound.to.clone();
        if let Err(e) = send(from, outbound, transport) {
            warn!(party = %from, to = %to, label, error = %e, "failed to send message");
        }
    }
}

fn send<T: Transport + ?Sized>(from: &PartyId, outbound: Outbound, transport: &T) -> Result<(), AgentError> {
    let envelope = Envelope::seal(from.clone(), outbound.to, &outbound.message)?;
    transport.deliver(envelope)?;
    Ok(())
}
