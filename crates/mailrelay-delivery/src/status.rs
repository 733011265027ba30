//! Per-recipient outcomes and per-envelope results.

use std::sync::Arc;

use mailrelay_smtp::{Address, Reply};

use crate::error::Error;

/// Recipient-level outcome derived from a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Outcome {
    /// 2xx: accepted.
    Ok,
    /// 4xx: deferred, may succeed later.
    TemporaryError,
    /// 5xx or anything malformed.
    PermanentError,
}

/// Classifies a reply code.
///
/// `200..=299` is [`Outcome::Ok`], `400..=499` is
/// [`Outcome::TemporaryError`], everything else is
/// [`Outcome::PermanentError`].
#[must_use]
pub const fn classify(code: u16) -> Outcome {
    match code {
        200..=299 => Outcome::Ok,
        400..=499 => Outcome::TemporaryError,
        _ => Outcome::PermanentError,
    }
}

/// Outcome of one recipient, with the reply it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientStatus {
    address: Address,
    reply: Reply,
    outcome: Outcome,
}

impl RecipientStatus {
    /// Records `reply` as the status of `address`.
    #[must_use]
    pub fn new(address: Address, reply: Reply) -> Self {
        let outcome = classify(reply.code.as_u16());
        Self {
            address,
            reply,
            outcome,
        }
    }

    /// Recipient address.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Reply the outcome was derived from.
    #[must_use]
    pub const fn reply(&self) -> &Reply {
        &self.reply
    }

    /// Enhanced status code from the reply text, if the server sent one.
    #[must_use]
    pub fn enhanced_code(&self) -> Option<&str> {
        self.reply.enhanced_code()
    }

    /// Derived outcome.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Returns true if the recipient was accepted.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

/// Result of one envelope.
///
/// Either the connection failed before the envelope was finalized, or every
/// recipient has a status, in declaration order.
#[derive(Debug, Clone)]
pub enum DeliveryResult {
    /// One status per recipient.
    Completed(Vec<RecipientStatus>),
    /// Connection or protocol failure shared by every affected envelope.
    Failed(Arc<Error>),
}

impl DeliveryResult {
    /// Recipient statuses, if the envelope was finalized by the server.
    #[must_use]
    pub fn statuses(&self) -> Option<&[RecipientStatus]> {
        match self {
            Self::Completed(statuses) => Some(statuses),
            Self::Failed(_) => None,
        }
    }

    /// The failure, if the envelope never got per-recipient statuses.
    #[must_use]
    pub fn error(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(error) => Some(error),
        }
    }

    /// Returns true if every recipient was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.statuses()
            .is_some_and(|statuses| statuses.iter().all(RecipientStatus::is_ok))
    }
}
