//! Delivery envelopes.

use bytes::Bytes;
use mailrelay_smtp::Address;

use crate::error::{Error, Result};

/// One MAIL/RCPT/DATA transaction: sender, recipients and message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
    body: Bytes,
}

impl Envelope {
    /// Creates an envelope.
    ///
    /// `sender` is `None` for the null reverse path (bounces). Recipients
    /// keep their order and may repeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRecipients`] if `recipients` is empty.
    pub fn new(
        sender: Option<Address>,
        recipients: impl IntoIterator<Item = Address>,
        body: impl Into<Bytes>,
    ) -> Result<Self> {
        let recipients: Vec<Address> = recipients.into_iter().collect();
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        Ok(Self {
            sender,
            recipients,
            body: body.into(),
        })
    }

    /// Reverse path, `None` for `MAIL FROM:<>`.
    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Recipients in declaration order.
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Message body as given, before dot-stuffing.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns true if the body has bytes outside 7-bit ASCII.
    #[must_use]
    pub fn is_8bit(&self) -> bool {
        !self.body.is_ascii()
    }

    /// Returns true if any envelope address needs SMTPUTF8.
    #[must_use]
    pub fn needs_smtputf8(&self) -> bool {
        self.sender.iter().chain(&self.recipients).any(|a| !a.is_ascii())
    }
}
