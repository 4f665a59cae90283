//! Protocol message definitions.
//!
//! Every message is JSON with a `performative` tag. `inform` messages carry a
//! second `kind` tag selecting join, leave, ack, job, done or completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::types::{JobId, OfferId, PartyId};

/// A priced offer sent by the broker and echoed back in the requester's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Identifies the broker round that produced this offer.
    pub offer_id: OfferId,
    /// Provider that will run the job.
    pub provider_id: PartyId,
    /// Total price (`price_per_unit * required_units`).
    pub price: f64,
    /// Units the requester asked for.
    pub required_units: u64,
    /// When the provider commits to have the job finished.
    pub committed_at: DateTime<Utc>,
}

/// Work handed from the broker to a provider after an accepted proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    /// Job identifier (the accepted offer's id).
    pub job_id: JobId,
    /// Units of work to perform.
    pub required_units: u64,
    /// Requester to notify on completion.
    pub requester_id: PartyId,
}

/// Outcome of a job as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The job finished.
    Done,
}

/// Completion report from a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// The job that finished.
    pub job: JobAssignment,
    /// Final status.
    pub status: JobStatus,
    /// Provider's committed availability after this job.
    pub available_from: DateTime<Utc>,
}

/// Body of an `inform` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inform {
    /// Provider announces (or refreshes) its capacity and price.
    Join {
        /// Units per interval.
        capacity: u64,
        /// Price charged per unit.
        price_per_unit: f64,
        /// Earliest instant the provider can start new work.
        available_from: DateTime<Utc>,
    },
    /// Provider withdraws from matching.
    Leave,
    /// Broker acknowledges a join or leave.
    Ack {
        /// Human-readable acknowledgement.
        text: String,
    },
    /// Broker hands a job to a provider.
    Job(JobAssignment),
    /// Provider reports a finished job.
    Done(JobReport),
    /// Broker tells the requester its job finished.
    Completion {
        /// The finished job.
        job_id: JobId,
        /// Opaque notice text.
        note: String,
    },
}

/// Messages exchanged between parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "performative", rename_all = "kebab-case")]
pub enum Message {
    /// Call for proposal.
    Cfp {
        /// Units the requester needs.
        required_units: u64,
        /// Latest acceptable start of the provider's availability.
        needed_by: DateTime<Utc>,
    },
    /// Broker's offer.
    Propose(Proposal),
    /// Requester takes the offer.
    AcceptProposal {
        /// Echo of the accepted offer.
        offer: Proposal,
    },
    /// Requester declines the offer.
    RejectProposal {
        /// Echo of the rejected offer.
        offer: Proposal,
    },
    /// Informational message.
    Inform(Inform),
}

impl Message {
    /// Create a call for proposal.
    #[must_use]
    pub const fn cfp(required_units: u64, needed_by: DateTime<Utc>) -> Self {
        Self::Cfp {
            required_units,
            needed_by,
        }
    }

    /// Create a join announcement.
    #[must_use]
    pub const fn join(capacity: u64, price_per_unit: f64, available_from: DateTime<Utc>) -> Self {
        Self::Inform(Inform::Join {
            capacity,
            price_per_unit,
            available_from,
        })
    }

    /// Create an acknowledgement.
    #[must_use]
    pub fn ack(text: impl Into<String>) -> Self {
        Self::Inform(Inform::Ack { text: text.into() })
    }

    /// Create a completion notice.
    #[must_use]
    pub fn completion(job_id: JobId, note: impl Into<String>) -> Self {
        Self::Inform(Inform::Completion {
            job_id,
            note: note.into(),
        })
    }

    /// Short label for logs, e.g. `propose` or `inform(done)`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cfp { .. } => "cfp",
            Self::Propose(_) => "propose",
            Self::AcceptProposal { .. } => "accept-proposal",
            Self::RejectProposal { .. } => "reject-proposal",
            Self::Inform(Inform::Join { .. }) => "inform(join)",
            Self::Inform(Inform::Leave) => "inform(leave)",
            Self::Inform(Inform::Ack { .. }) => "inform(ack)",
            Self::Inform(Inform::Job(_)) => "inform(job)",
            Self::Inform(Inform::Done(_)) => "inform(done)",
            Self::Inform(Inform::Completion { .. }) => "inform(completion)",
        }
    }

    /// Check value ranges the JSON schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Validation`] for zero units or capacity and for
    /// non-finite or non-positive prices.
    pub fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::Cfp { required_units, .. } => positive_units(*required_units, "required_units"),
            Self::Propose(offer)
            | Self::AcceptProposal { offer }
            | Self::RejectProposal { offer } => {
                positive_units(offer.required_units, "required_units")?;
                if !offer.price.is_finite() || offer.price < 0.0 {
                    return Err(ProtoError::Validation(format!(
                        "offer price must be a non-negative number, got {}",
                        offer.price
                    )));
                }
                Ok(())
            }
            Self::Inform(Inform::Join {
                capacity,
                price_per_unit,
                ..
            }) => {
                positive_units(*capacity, "capacity")?;
                if !price_per_unit.is_finite() || *price_per_unit <= 0.0 {
                    return Err(ProtoError::Validation(format!(
                        "price_per_unit must be positive, got {price_per_unit}"
                    )));
                }
                Ok(())
            }
            Self::Inform(Inform::Job(job) | Inform::Done(JobReport { job, .. })) => {
                positive_units(job.required_units, "required_units")
            }
            Self::Inform(Inform::Leave | Inform::Ack { .. } | Inform::Completion { .. }) => Ok(()),
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a well-formed message.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let msg: Self =
            serde_json::from_str(json).map_err(|e| ProtoError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

fn positive_units(value: u64, field: &str) -> Result<(), ProtoError> {
    if value == 0 {
        return Err(ProtoError::Validation(format!("{field} must be positive")));
    }
    Ok(())
}

/// An encoded message in transit, stamped with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending party.
    pub from: PartyId,
    /// Receiving party.
    pub to: PartyId,
    /// JSON payload.
    pub payload: String,
}

impl Envelope {
    /// Encode a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn seal(from: PartyId, to: PartyId, message: &Message) -> Result<Self, ProtoError> {
        Ok(Self {
            from,
            to,
            payload: message.to_json()?,
        })
    }

    /// Decode the carried message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed.
    pub fn open(&self) -> Result<Message, ProtoError> {
        Message::from_json(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn proposal() -> Proposal {
        Proposal {
            offer_id: OfferId::new(),
            provider_id: PartyId::from("provider-1"),
            price: 20.0,
            required_units: 20,
            committed_at: t0(),
        }
    }

    #[test]
    fn cfp_uses_performative_tag() {
        let json = Message::cfp(20, t0()).to_json().unwrap();
        assert!(json.contains("\"performative\":\"cfp\""));
        assert!(json.contains("\"required_units\":20"));
    }

    #[test]
    fn decision_labels_are_kebab_case() {
        let accept = Message::AcceptProposal { offer: proposal() }.to_json().unwrap();
        let reject = Message::RejectProposal { offer: proposal() }.to_json().unwrap();
        assert!(accept.contains("accept-proposal"));
        assert!(reject.contains("reject-proposal"));
    }

    #[test]
    fn inform_done_carries_status_and_kind() {
        let msg = Message::Inform(Inform::Done(JobReport {
            job: JobAssignment {
                job_id: OfferId::new(),
                required_units: 5,
                requester_id: PartyId::from("requester-1"),
            },
            status: JobStatus::Done,
            available_from: t0(),
        }));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"kind\":\"done\""));
        assert!(json.contains("\"status\":\"DONE\""));
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn leave_has_no_payload() {
        let json = Message::Inform(Inform::Leave).to_json().unwrap();
        assert_eq!(json, r#"{"performative":"inform","kind":"leave"}"#);
        assert_eq!(Message::from_json(&json).unwrap().label(), "inform(leave)");
    }

    #[test_case(r#"{"performative":"cfp"}"# ; "missing fields")]
    #[test_case(r#"{"performative":"haggle","units":3}"# ; "unknown performative")]
    #[test_case(r#"{"performative":"inform","kind":"gossip"}"# ; "unknown inform kind")]
    #[test_case("not json" ; "garbage")]
    fn malformed_payloads_are_rejected(payload: &str) {
        let err = Message::from_json(payload).unwrap_err();
        assert!(matches!(err, ProtoError::Malformed(_)));
        assert!(err.is_malformed());
    }

    #[test]
    fn zero_units_fail_validation() {
        let json = Message::cfp(0, t0()).to_json().unwrap();
        let err = Message::from_json(&json).unwrap_err();
        assert!(matches!(err, ProtoError::Validation(_)));
        assert!(err.is_malformed());
    }

    #[test]
    fn join_with_non_positive_price_fails_validation() {
        let msg = Message::join(45, 0.0, t0());
        assert!(msg.validate().is_err());
        assert!(Message::join(45, 1.0, t0()).validate().is_ok());
    }

    #[test]
    fn envelope_seal_and_open() {
        let env = Envelope::seal(
            PartyId::from("requester-1"),
            PartyId::from("broker"),
            &Message::cfp(10, t0()),
        )
        .unwrap();
        assert_eq!(env.from.as_str(), "requester-1");
        assert_eq!(env.open().unwrap(), Message::cfp(10, t0()));
    }

    #[test]
    fn labels_match_wire_names() {
        assert_eq!(Message::ack("ok").label(), "inform(ack)");
        assert_eq!(Message::Propose(proposal()).label(), "propose");
        assert_eq!(Message::completion(OfferId::new(), "done").label(), "inform(completion)");
    }
}
