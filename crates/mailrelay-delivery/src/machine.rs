//! Reply-driven delivery state machine.
//!
//! The machine does no I/O. It is fed the connect result and every reply in
//! the order they arrive, and answers with the [`Action`]s to perform next.
//! Expected replies are kept in a FIFO queue, so pipelined replies are matched
//! to their commands positionally.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use mailrelay_smtp::{AuthMechanism, BodyType, Capabilities, Command, Reply, ReplyCode};

use crate::config::{DeliveryConfig, PipeliningMode, Protocol, TlsMode};
use crate::cursor::TransactionCursor;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::status::DeliveryResult;

/// I/O requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a command.
    Send(Command),
    /// Write a message body (dot-stuffed by the session).
    SendMessage(Bytes),
    /// Perform the TLS handshake, then call
    /// [`DeliveryMachine::on_tls_established`].
    StartTls,
}

/// Coarse position in the dialogue, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the transport.
    Connecting,
    /// EHLO, LHLO or HELO outstanding.
    Hello,
    /// STARTTLS reply or handshake outstanding.
    StartTls,
    /// AUTH exchange in progress.
    Auth,
    /// Inside a MAIL/RCPT/DATA transaction, or resetting one.
    Transaction,
    /// QUIT sent.
    Quit,
    /// Nothing more to do.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStep {
    Plain,
    LoginUsername,
    LoginPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterReset {
    Mail,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Ehlo,
    Helo,
    StartTls,
    Handshake,
    AuthChallenge(AuthStep),
    AuthResult,
    Reset(AfterReset),
    Mail,
    Rcpt(usize),
    Data,
    DataCompletion,
    LmtpDataCompletion(usize),
    AbandonedData,
    Quit,
}

/// Drives one session through every envelope of a delivery.
#[derive(Debug)]
pub struct DeliveryMachine {
    config: DeliveryConfig,
    cursor: TransactionCursor,
    expected: VecDeque<Expect>,
    capabilities: Capabilities,
    encrypted: bool,
    authenticated_as: Option<String>,
    keep_session: bool,
    started: bool,
    pipelining: bool,
    tls_declined: bool,
    helo_fallback: bool,
    mail_rejected: bool,
    needs_reset: bool,
    finished: bool,
    reusable: bool,
}

impl DeliveryMachine {
    /// Creates a machine for `envelopes`.
    ///
    /// `keep_session` ends the dialogue with a clean session instead of QUIT,
    /// for transports that reuse sessions.
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        envelopes: impl IntoIterator<Item = Envelope>,
        keep_session: bool,
    ) -> Self {
        Self {
            config,
            cursor: TransactionCursor::new(envelopes),
            expected: VecDeque::new(),
            capabilities: Capabilities::default(),
            encrypted: false,
            authenticated_as: None,
            keep_session,
            started: false,
            pipelining: false,
            tls_declined: false,
            helo_fallback: false,
            mail_rejected: false,
            needs_reset: false,
            finished: false,
            reusable: false,
        }
    }

    /// Starts the dialogue on a connected session.
    ///
    /// `greeting` is `None` for a reused session, which skips straight to the
    /// first transaction using the session's recorded `capabilities`, once
    /// its encryption and `authenticated_as` user satisfy the configuration.
    pub fn on_connected(
        &mut self,
        greeting: Option<Reply>,
        capabilities: Capabilities,
        encrypted: bool,
        authenticated_as: Option<&str>,
    ) -> Vec<Action> {
        self.started = true;
        self.encrypted = encrypted;
        self.authenticated_as = authenticated_as.map(str::to_owned);
        let mut actions = Vec::new();

        let step = match greeting {
            Some(greeting) if greeting.is_success() => {
                self.send_hello(&mut actions);
                Ok(())
            }
            Some(greeting) => Err(rejected("greeting", &greeting)),
            None => {
                tracing::debug!("Reusing negotiated session");
                self.capabilities = capabilities;
                self.check_reused_session()
                    .and_then(|()| self.decide_pipelining())
                    .and_then(|()| self.next_envelope(&mut actions))
            }
        };
        self.settle(step, actions)
    }

    /// Feeds the next reply.
    pub fn on_reply(&mut self, reply: Reply) -> Vec<Action> {
        let mut actions = Vec::new();
        let step = match self.expected.pop_front() {
            Some(expect) => self.handle(expect, reply, &mut actions),
            None => Err(Error::Protocol(format!("Unexpected reply: {reply}"))),
        };
        self.settle(step, actions)
    }

    /// Continues after the TLS handshake requested by [`Action::StartTls`].
    pub fn on_tls_established(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let step = if self.expected.front() == Some(&Expect::Handshake) {
            self.expected.pop_front();
            self.encrypted = true;
            tracing::debug!("STARTTLS complete, repeating EHLO");
            self.send_hello(&mut actions);
            Ok(())
        } else {
            Err(Error::Protocol("TLS established without STARTTLS".into()))
        };
        self.settle(step, actions)
    }

    /// Ends the dialogue with a connection-level failure.
    ///
    /// Every envelope not yet finalized gets `error`; finalized envelopes keep
    /// their results.
    pub fn fail(&mut self, error: Error) {
        if !self.cursor.is_finished() {
            tracing::warn!(
                error = %error,
                remaining = self.cursor.remaining(),
                "Delivery failed"
            );
        }
        let error = Arc::new(error);
        self.cursor.fail_remaining(&error);
        self.expected.clear();
        self.finished = true;
        self.reusable = false;
    }

    /// Returns true once the dialogue is over.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns true while replies are outstanding.
    #[must_use]
    pub fn awaiting_reply(&self) -> bool {
        self.expected
            .front()
            .is_some_and(|expect| *expect != Expect::Handshake)
    }

    /// Returns true if the session ended clean and may be handed out again.
    #[must_use]
    pub const fn is_reusable(&self) -> bool {
        self.finished && self.reusable
    }

    /// User the session authenticated as, if any.
    #[must_use]
    pub fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    /// Returns true if commands are being pipelined on this session.
    #[must_use]
    pub const fn is_pipelining(&self) -> bool {
        self.pipelining
    }

    /// Capabilities negotiated so far.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.finished {
            return Phase::Finished;
        }
        match self.expected.front() {
            None if !self.started => Phase::Connecting,
            None => Phase::Finished,
            Some(Expect::Ehlo | Expect::Helo) => Phase::Hello,
            Some(Expect::StartTls | Expect::Handshake) => Phase::StartTls,
            Some(Expect::AuthChallenge(_) | Expect::AuthResult) => Phase::Auth,
            Some(Expect::Quit) => Phase::Quit,
            Some(_) => Phase::Transaction,
        }
    }

    /// Consumes the machine, returning one result per envelope.
    #[must_use]
    pub fn into_results(self) -> Vec<DeliveryResult> {
        self.cursor.into_results()
    }

    fn settle(&mut self, step: Result<()>, actions: Vec<Action>) -> Vec<Action> {
        match step {
            Ok(()) => actions,
            Err(error) => {
                self.fail(error);
                Vec::new()
            }
        }
    }

    fn handle(&mut self, expect: Expect, reply: Reply, actions: &mut Vec<Action>) -> Result<()> {
        match expect {
            Expect::Ehlo => self.on_ehlo(&reply, actions),
            Expect::Helo => {
                if !reply.is_success() {
                    return Err(rejected("HELO", &reply));
                }
                self.capabilities = Capabilities::from_ehlo(&reply);
                self.after_hello(actions)
            }
            Expect::StartTls => self.on_starttls(&reply, actions),
            Expect::Handshake => Err(Error::Protocol(format!(
                "Reply during TLS handshake: {reply}"
            ))),
            Expect::AuthChallenge(step) => self.on_auth_challenge(step, &reply, actions),
            Expect::AuthResult => {
                if !reply.is_success() {
                    return Err(auth_failed(&reply));
                }
                tracing::debug!("Authenticated");
                self.authenticated_as = self
                    .config
                    .credentials()
                    .map(|credentials| credentials.username.clone());
                self.next_envelope(actions)
            }
            Expect::Reset(then) => {
                if !reply.is_success() {
                    return Err(rejected("RSET", &reply));
                }
                match then {
                    AfterReset::Mail => {
                        if !self.pipelining {
                            self.send_mail(actions);
                        }
                        Ok(())
                    }
                    AfterReset::Release => {
                        self.finish_session();
                        Ok(())
                    }
                }
            }
            Expect::Mail => self.on_mail(&reply, actions),
            Expect::Rcpt(index) => self.on_rcpt(index, reply, actions),
            Expect::Data => self.on_data(&reply, actions),
            Expect::DataCompletion => {
                for index in self.cursor.accepted() {
                    self.cursor.record_status(index, reply.clone());
                }
                self.needs_reset = false;
                self.finish_envelope(actions)
            }
            Expect::LmtpDataCompletion(index) => {
                self.cursor.record_status(index, reply);
                if self.expected.is_empty() {
                    self.needs_reset = false;
                    self.finish_envelope(actions)
                } else {
                    Ok(())
                }
            }
            Expect::AbandonedData => {
                tracing::debug!(%reply, "Discarded reply to empty message");
                self.finish_envelope(actions)
            }
            Expect::Quit => {
                self.finished = true;
                Ok(())
            }
        }
    }

    fn send_hello(&mut self, actions: &mut Vec<Action>) {
        let hostname = self.config.helo_name().to_owned();
        let command = match self.config.protocol() {
            Protocol::Smtp => Command::Ehlo { hostname },
            Protocol::Lmtp => Command::Lhlo { hostname },
        };
        actions.push(Action::Send(command));
        self.expected.push_back(Expect::Ehlo);
    }

    fn on_ehlo(&mut self, reply: &Reply, actions: &mut Vec<Action>) -> Result<()> {
        if reply.is_success() {
            self.capabilities = Capabilities::from_ehlo(reply);
            tracing::debug!(
                server = %self.capabilities.server_name,
                extensions = self.capabilities.extensions.len(),
                encrypted = self.encrypted,
                "Capabilities negotiated"
            );
            return self.after_hello(actions);
        }

        if self.config.protocol() == Protocol::Lmtp {
            return Err(rejected("LHLO", reply));
        }
        if self.helo_fallback || self.encrypted {
            return Err(rejected("EHLO", reply));
        }

        tracing::debug!(%reply, "EHLO rejected, falling back to HELO");
        self.helo_fallback = true;
        actions.push(Action::Send(Command::Helo {
            hostname: self.config.helo_name().to_owned(),
        }));
        self.expected.push_back(Expect::Helo);
        Ok(())
    }

    fn after_hello(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        let tls = self.config.tls();
        if !self.encrypted && !self.tls_declined && tls != TlsMode::Disabled {
            if self.capabilities.supports_starttls() {
                actions.push(Action::Send(Command::StartTls));
                self.expected.push_back(Expect::StartTls);
                return Ok(());
            }
            if tls == TlsMode::Required {
                return Err(Error::Unsupported("STARTTLS"));
            }
            tracing::debug!("STARTTLS not offered, continuing in plaintext");
        }

        self.decide_pipelining()?;
        self.authenticate(actions)
    }

    fn on_starttls(&mut self, reply: &Reply, actions: &mut Vec<Action>) -> Result<()> {
        if reply.is_success() {
            actions.push(Action::StartTls);
            self.expected.push_back(Expect::Handshake);
            return Ok(());
        }

        if self.config.tls() == TlsMode::Required {
            return Err(rejected("STARTTLS", reply));
        }
        tracing::debug!(%reply, "STARTTLS refused, continuing in plaintext");
        self.tls_declined = true;
        self.after_hello(actions)
    }

    /// A reused session skips STARTTLS and AUTH, so it must already match
    /// the configured policy.
    fn check_reused_session(&self) -> Result<()> {
        if self.config.tls() == TlsMode::Required && !self.encrypted {
            return Err(Error::Unsupported("STARTTLS"));
        }
        let wanted = self
            .config
            .credentials()
            .map(|credentials| credentials.username.as_str());
        if wanted != self.authenticated_as.as_deref() {
            return Err(Error::SessionMismatch("credentials"));
        }
        Ok(())
    }

    fn decide_pipelining(&mut self) -> Result<()> {
        let advertised = self.capabilities.supports_pipelining();
        self.pipelining = match self.config.pipelining() {
            PipeliningMode::Disabled => false,
            PipeliningMode::Opportunistic => advertised,
            PipeliningMode::Required if advertised => true,
            PipeliningMode::Required => return Err(Error::Unsupported("PIPELINING")),
        };
        tracing::debug!(pipelining = self.pipelining, "Pipelining decided");
        Ok(())
    }

    fn authenticate(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        let Some(credentials) = self.config.credentials() else {
            return self.next_envelope(actions);
        };

        let mechanism = credentials.mechanism;
        if !self.capabilities.auth_mechanisms().contains(&mechanism) {
            return Err(Error::Unsupported(match mechanism {
                AuthMechanism::Login => "AUTH LOGIN",
                _ => "AUTH PLAIN",
            }));
        }

        let step = match mechanism {
            AuthMechanism::Login => AuthStep::LoginUsername,
            _ => AuthStep::Plain,
        };
        actions.push(Action::Send(Command::Auth { mechanism }));
        self.expected.push_back(Expect::AuthChallenge(step));
        Ok(())
    }

    fn on_auth_challenge(
        &mut self,
        step: AuthStep,
        reply: &Reply,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return Err(auth_failed(reply));
        }
        let Some(credentials) = self.config.credentials() else {
            return Err(Error::Protocol("AUTH challenge without credentials".into()));
        };

        let (response, next) = match step {
            AuthStep::Plain => {
                let token = format!("\0{}\0{}", credentials.username, credentials.secret);
                (STANDARD.encode(token), Expect::AuthResult)
            }
            AuthStep::LoginUsername => (
                STANDARD.encode(&credentials.username),
                Expect::AuthChallenge(AuthStep::LoginPassword),
            ),
            AuthStep::LoginPassword => (STANDARD.encode(&credentials.secret), Expect::AuthResult),
        };
        actions.push(Action::Send(Command::AuthResponse(response)));
        self.expected.push_back(next);
        Ok(())
    }

    /// Starts the next envelope, or ends the session when none remain.
    fn next_envelope(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        loop {
            let Some(envelope) = self.cursor.begin_envelope() else {
                self.end_session(actions);
                return Ok(());
            };

            let size = envelope.body().len();
            let local_refusal = if let Some(limit) = self.capabilities.max_message_size()
                && size > limit
            {
                tracing::debug!(size, limit, "Message exceeds server size limit");
                Some(Reply::single(
                    ReplyCode::EXCEEDED_STORAGE.as_u16(),
                    format!("5.3.4 Message size {size} exceeds server limit {limit}"),
                ))
            } else if envelope.needs_smtputf8() && !self.capabilities.supports_smtputf8() {
                tracing::debug!("Non-ASCII address without SMTPUTF8 support");
                Some(Reply::single(
                    ReplyCode::MAILBOX_NAME_NOT_ALLOWED.as_u16(),
                    "5.6.7 Non-ASCII address requires SMTPUTF8",
                ))
            } else {
                None
            };

            if let Some(reply) = local_refusal {
                self.cursor.record_all(&reply);
                if self.cursor.finish_envelope()? {
                    continue;
                }
                self.end_session(actions);
                return Ok(());
            }

            if self.needs_reset {
                self.needs_reset = false;
                actions.push(Action::Send(Command::Rset));
                self.expected.push_back(Expect::Reset(AfterReset::Mail));
                if !self.pipelining {
                    return Ok(());
                }
            }

            self.send_mail(actions);
            return Ok(());
        }
    }

    fn send_mail(&mut self, actions: &mut Vec<Action>) {
        let Some(envelope) = self.cursor.active() else {
            return;
        };

        let capabilities = &self.capabilities;
        let command = Command::MailFrom {
            from: envelope.sender().cloned(),
            body: (envelope.is_8bit() && capabilities.supports_8bitmime())
                .then_some(BodyType::EightBitMime),
            size: capabilities
                .supports_size()
                .then(|| envelope.body().len()),
            smtputf8: envelope.needs_smtputf8() && capabilities.supports_smtputf8(),
        };

        self.mail_rejected = false;
        actions.push(Action::Send(command));
        self.expected.push_back(Expect::Mail);

        if self.pipelining {
            while let Some((index, to)) = self.cursor.advance_recipient() {
                actions.push(Action::Send(Command::RcptTo { to }));
                self.expected.push_back(Expect::Rcpt(index));
            }
            actions.push(Action::Send(Command::Data));
            self.expected.push_back(Expect::Data);
        }
    }

    fn on_mail(&mut self, reply: &Reply, actions: &mut Vec<Action>) -> Result<()> {
        if !reply.is_success() {
            tracing::debug!(%reply, "MAIL FROM rejected");
            self.mail_rejected = true;
            self.needs_reset = true;
            self.cursor.record_all(reply);
            if !self.pipelining {
                return self.finish_envelope(actions);
            }
            return Ok(());
        }

        if !self.pipelining {
            self.send_rcpt_or_data(actions);
        }
        Ok(())
    }

    fn on_rcpt(&mut self, index: usize, reply: Reply, actions: &mut Vec<Action>) -> Result<()> {
        if self.mail_rejected {
            return Ok(());
        }
        if !reply.is_success() {
            tracing::debug!(
                index,
                %reply,
                enhanced = reply.enhanced_code().unwrap_or("-"),
                "Recipient rejected"
            );
        }
        self.cursor.record_status(index, reply);

        if self.pipelining {
            return Ok(());
        }
        let exhausted = self.cursor.recipients_started() == self.recipient_count();
        if exhausted && self.cursor.accepted().is_empty() {
            tracing::debug!("No recipient accepted, skipping DATA");
            self.needs_reset = true;
            return self.finish_envelope(actions);
        }
        self.send_rcpt_or_data(actions);
        Ok(())
    }

    fn send_rcpt_or_data(&mut self, actions: &mut Vec<Action>) {
        if let Some((index, to)) = self.cursor.advance_recipient() {
            actions.push(Action::Send(Command::RcptTo { to }));
            self.expected.push_back(Expect::Rcpt(index));
        } else {
            actions.push(Action::Send(Command::Data));
            self.expected.push_back(Expect::Data);
        }
    }

    fn on_data(&mut self, reply: &Reply, actions: &mut Vec<Action>) -> Result<()> {
        let accepted = self.cursor.accepted();

        if reply.code == ReplyCode::START_DATA {
            if accepted.is_empty() {
                tracing::debug!("DATA accepted without recipients, sending empty message");
                actions.push(Action::SendMessage(Bytes::new()));
                if self.config.protocol() == Protocol::Lmtp {
                    return self.finish_envelope(actions);
                }
                self.expected.push_back(Expect::AbandonedData);
                return Ok(());
            }

            let body = self
                .cursor
                .active()
                .map(|envelope| envelope.body().clone())
                .unwrap_or_default();
            actions.push(Action::SendMessage(body));
            match self.config.protocol() {
                Protocol::Smtp => self.expected.push_back(Expect::DataCompletion),
                Protocol::Lmtp => self
                    .expected
                    .extend(accepted.into_iter().map(Expect::LmtpDataCompletion)),
            }
            return Ok(());
        }

        if reply.is_success() {
            return Err(Error::Protocol(format!("DATA answered without 354: {reply}")));
        }

        if !self.mail_rejected {
            for index in accepted {
                self.cursor.record_status(index, reply.clone());
            }
        }
        self.needs_reset = true;
        self.finish_envelope(actions)
    }

    fn finish_envelope(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        self.cursor.finish_envelope()?;
        self.next_envelope(actions)
    }

    fn end_session(&mut self, actions: &mut Vec<Action>) {
        if !self.keep_session {
            actions.push(Action::Send(Command::Quit));
            self.expected.push_back(Expect::Quit);
            return;
        }

        if self.needs_reset {
            self.needs_reset = false;
            actions.push(Action::Send(Command::Rset));
            self.expected.push_back(Expect::Reset(AfterReset::Release));
        } else {
            self.finish_session();
        }
    }

    fn finish_session(&mut self) {
        self.finished = true;
        self.reusable = true;
    }

    fn recipient_count(&self) -> usize {
        self.cursor
            .active()
            .map_or(0, |envelope| envelope.recipients().len())
    }
}

fn rejected(command: &'static str, reply: &Reply) -> Error {
    Error::Rejected {
        command,
        code: reply.code.as_u16(),
        message: reply.message_text(),
    }
}

fn auth_failed(reply: &Reply) -> Error {
    Error::Authentication {
        code: reply.code.as_u16(),
        message: reply.message_text(),
    }
}
