//! Per-session progress through the submitted envelopes.

use std::collections::VecDeque;
use std::sync::Arc;

use mailrelay_smtp::{Address, Reply};

use crate::envelope::Envelope;
use crate::error::Error;
use crate::status::{DeliveryResult, RecipientStatus};

#[derive(Debug)]
struct ActiveEnvelope {
    envelope: Envelope,
    next_recipient: usize,
    statuses: Vec<Option<RecipientStatus>>,
}

/// Tracks which envelope and recipient a session is working on, and the
/// results gathered so far.
///
/// Results are appended in submission order; every envelope ends up with
/// exactly one [`DeliveryResult`].
#[derive(Debug)]
pub struct TransactionCursor {
    pending: VecDeque<Envelope>,
    active: Option<ActiveEnvelope>,
    completed: Vec<DeliveryResult>,
}

impl TransactionCursor {
    /// Creates a cursor over `envelopes`, none started.
    #[must_use]
    pub fn new(envelopes: impl IntoIterator<Item = Envelope>) -> Self {
        Self {
            pending: envelopes.into_iter().collect(),
            active: None,
            completed: Vec::new(),
        }
    }

    /// Starts the next envelope, unless one is already active.
    ///
    /// Returns the active envelope, or `None` once every envelope is done.
    pub fn begin_envelope(&mut self) -> Option<&Envelope> {
        if self.active.is_none() {
            let envelope = self.pending.pop_front()?;
            let recipients = envelope.recipients().len();
            self.active = Some(ActiveEnvelope {
                envelope,
                next_recipient: 0,
                statuses: vec![None; recipients],
            });
        }
        self.active()
    }

    /// The envelope currently being processed.
    #[must_use]
    pub fn active(&self) -> Option<&Envelope> {
        self.active.as_ref().map(|active| &active.envelope)
    }

    /// Moves to the next recipient of the active envelope.
    ///
    /// Returns its index and address, or `None` when the recipients are
    /// exhausted.
    pub fn advance_recipient(&mut self) -> Option<(usize, Address)> {
        let active = self.active.as_mut()?;
        let index = active.next_recipient;
        let address = active.envelope.recipients().get(index)?.clone();
        active.next_recipient += 1;
        Some((index, address))
    }

    /// Number of recipients of the active envelope already handed out.
    #[must_use]
    pub fn recipients_started(&self) -> usize {
        self.active.as_ref().map_or(0, |active| active.next_recipient)
    }

    /// Records the status of recipient `index` of the active envelope,
    /// replacing any earlier status.
    pub fn record_status(&mut self, index: usize, reply: Reply) {
        if let Some(active) = self.active.as_mut()
            && let Some(address) = active.envelope.recipients().get(index)
        {
            active.statuses[index] = Some(RecipientStatus::new(address.clone(), reply));
        }
    }

    /// Records `reply` for every recipient of the active envelope.
    pub fn record_all(&mut self, reply: &Reply) {
        let count = self
            .active
            .as_ref()
            .map_or(0, |active| active.envelope.recipients().len());
        for index in 0..count {
            self.record_status(index, reply.clone());
        }
    }

    /// Indices of recipients whose recorded status is accepted, in order.
    #[must_use]
    pub fn accepted(&self) -> Vec<usize> {
        self.active.as_ref().map_or_else(Vec::new, |active| {
            active
                .statuses
                .iter()
                .enumerate()
                .filter(|(_, status)| status.as_ref().is_some_and(RecipientStatus::is_ok))
                .map(|(index, _)| index)
                .collect()
        })
    }

    /// Finalizes the active envelope with its recorded statuses.
    ///
    /// Returns true if more envelopes remain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a recipient has no status yet.
    pub fn finish_envelope(&mut self) -> Result<bool, Error> {
        let Some(active) = self.active.take() else {
            return Ok(!self.pending.is_empty());
        };

        let statuses: Option<Vec<RecipientStatus>> = active.statuses.into_iter().collect();
        let Some(statuses) = statuses else {
            return Err(Error::Protocol(
                "Envelope finished without a status for every recipient".into(),
            ));
        };

        self.completed.push(DeliveryResult::Completed(statuses));
        Ok(!self.pending.is_empty())
    }

    /// Fails the active envelope and every envelope not yet started with the
    /// same error.
    pub fn fail_remaining(&mut self, error: &Arc<Error>) {
        if self.active.take().is_some() {
            self.completed.push(DeliveryResult::Failed(Arc::clone(error)));
        }
        for _ in self.pending.drain(..) {
            self.completed.push(DeliveryResult::Failed(Arc::clone(error)));
        }
    }

    /// Returns true once every envelope has a result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Envelopes not yet finalized, including the active one.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }

    /// Consumes the cursor, returning the finalized results.
    #[must_use]
    pub fn into_results(self) -> Vec<DeliveryResult> {
        self.completed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::Outcome;

    fn envelope(recipients: &[&str]) -> Envelope {
        Envelope::new(
            None,
            recipients.iter().map(|r| Address::new(*r).unwrap()),
            "body",
        )
        .unwrap()
    }

    #[test]
    fn walks_recipients_in_order() {
        let mut cursor = TransactionCursor::new([envelope(&["a@x.org", "b@x.org"])]);
        assert!(cursor.advance_recipient().is_none());

        cursor.begin_envelope().unwrap();
        let (first, a) = cursor.advance_recipient().unwrap();
        let (second, b) = cursor.advance_recipient().unwrap();
        assert_eq!((first, a.as_str()), (0, "a@x.org"));
        assert_eq!((second, b.as_str()), (1, "b@x.org"));
        assert!(cursor.advance_recipient().is_none());
        assert_eq!(cursor.recipients_started(), 2);
    }

    #[test]
    fn finish_advances_to_next_envelope() {
        let mut cursor =
            TransactionCursor::new([envelope(&["a@x.org"]), envelope(&["b@x.org"])]);

        cursor.begin_envelope().unwrap();
        cursor.record_status(0, Reply::single(250, "ok"));
        assert!(cursor.finish_envelope().unwrap());
        assert_eq!(cursor.remaining(), 1);

        let next = cursor.begin_envelope().unwrap();
        assert_eq!(next.recipients()[0].as_str(), "b@x.org");
        cursor.record_status(0, Reply::single(550, "no"));
        assert!(!cursor.finish_envelope().unwrap());
        assert!(cursor.is_finished());

        let results = cursor.into_results();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert_eq!(
            results[1].statuses().unwrap()[0].outcome(),
            Outcome::PermanentError
        );
    }

    #[test]
    fn finishing_without_all_statuses_is_an_error() {
        let mut cursor = TransactionCursor::new([envelope(&["a@x.org", "b@x.org"])]);
        cursor.begin_envelope().unwrap();
        cursor.record_status(0, Reply::single(250, "ok"));
        assert!(matches!(cursor.finish_envelope(), Err(Error::Protocol(_))));
    }

    #[test]
    fn accepted_lists_ok_recipients() {
        let mut cursor =
            TransactionCursor::new([envelope(&["a@x.org", "b@x.org", "c@x.org"])]);
        cursor.begin_envelope().unwrap();
        cursor.record_status(0, Reply::single(550, "no"));
        cursor.record_status(1, Reply::single(250, "ok"));
        cursor.record_status(2, Reply::single(251, "forwarded"));
        assert_eq!(cursor.accepted(), [1, 2]);
    }

    #[test]
    fn fail_remaining_shares_one_error() {
        let mut cursor = TransactionCursor::new([
            envelope(&["a@x.org"]),
            envelope(&["b@x.org"]),
            envelope(&["c@x.org"]),
        ]);
        cursor.begin_envelope().unwrap();
        cursor.record_status(0, Reply::single(250, "ok"));
        cursor.finish_envelope().unwrap();
        cursor.begin_envelope().unwrap();

        let error = Arc::new(Error::ConnectionClosed);
        cursor.fail_remaining(&error);
        assert!(cursor.is_finished());

        let results = cursor.into_results();
        assert!(results[0].is_success());
        let second = results[1].error().unwrap();
        let third = results[2].error().unwrap();
        assert!(Arc::ptr_eq(second, third));
    }
}
