//! # capnet-proto
//!
//! Wire protocol for capnet capacity brokering.
//!
//! Requesters, the broker and providers exchange a small set of
//! Contract-Net style messages (`cfp`, `propose`, `accept-proposal`,
//! `reject-proposal`, `inform`). Messages travel inside an [`Envelope`]
//! that always carries the sender's [`PartyId`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtoError;
pub use messages::{Envelope, Inform, JobAssignment, JobReport, JobStatus, Message, Proposal};
pub use types::{JobId, OfferId, PartyId};
