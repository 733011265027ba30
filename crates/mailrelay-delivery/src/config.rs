//! Delivery configuration.

use std::net::SocketAddr;
use std::time::Duration;

use mailrelay_smtp::{AuthMechanism, ConnectOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default timeout for connecting and reading the greeting.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for each reply (RFC 5321 section 4.5.3.2).
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Dialect spoken with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SMTP (RFC 5321).
    #[default]
    Smtp,
    /// LMTP (RFC 2033): LHLO, and one end-of-data reply per recipient.
    Lmtp,
}

/// STARTTLS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Never upgrade.
    Disabled,
    /// Upgrade when advertised, otherwise continue in plaintext.
    #[default]
    Opportunistic,
    /// Fail unless the session can be upgraded.
    Required,
}

/// Command pipelining policy (RFC 2920).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeliningMode {
    /// Strict request/response.
    Disabled,
    /// Pipeline when the server advertises PIPELINING.
    #[default]
    Opportunistic,
    /// Fail unless the server advertises PIPELINING.
    Required,
}

/// AUTH credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password. Never serialized.
    #[serde(skip_serializing, default)]
    pub secret: String,
    /// SASL mechanism, PLAIN or LOGIN.
    pub mechanism: AuthMechanism,
}

impl Credentials {
    /// Creates credentials for the PLAIN mechanism.
    #[must_use]
    pub fn plain(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            mechanism: AuthMechanism::Plain,
        }
    }

    /// Creates credentials for the LOGIN mechanism.
    #[must_use]
    pub fn login(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            mechanism: AuthMechanism::Login,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"****")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Immutable settings for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeliveryConfigBuilder")]
pub struct DeliveryConfig {
    connect_timeout: Duration,
    response_timeout: Duration,
    local_address: Option<SocketAddr>,
    helo_name: String,
    protocol: Protocol,
    tls: TlsMode,
    pipelining: PipeliningMode,
    credentials: Option<Credentials>,
}

impl DeliveryConfig {
    /// Creates a configuration builder with SMTP defaults.
    #[must_use]
    pub fn builder() -> DeliveryConfigBuilder {
        DeliveryConfigBuilder::default()
    }

    /// Creates a configuration builder for strict LMTP: pipelining required,
    /// no STARTTLS.
    #[must_use]
    pub fn lmtp() -> DeliveryConfigBuilder {
        DeliveryConfigBuilder {
            protocol: Protocol::Lmtp,
            tls: TlsMode::Disabled,
            pipelining: PipeliningMode::Required,
            ..DeliveryConfigBuilder::default()
        }
    }

    /// Timeout for connecting and reading the greeting.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Timeout for each reply.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Local address to bind.
    #[must_use]
    pub const fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// Name sent in EHLO/HELO/LHLO.
    #[must_use]
    pub fn helo_name(&self) -> &str {
        &self.helo_name
    }

    /// Protocol dialect.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// STARTTLS policy.
    #[must_use]
    pub const fn tls(&self) -> TlsMode {
        self.tls
    }

    /// Pipelining policy.
    #[must_use]
    pub const fn pipelining(&self) -> PipeliningMode {
        self.pipelining
    }

    /// AUTH credentials, if any.
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Options passed to [`Transport::connect`](mailrelay_smtp::Transport::connect).
    ///
    /// Carries the TLS and AUTH policy so a pooling transport only hands out
    /// sessions that already satisfy it.
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            local_address: self.local_address,
            require_tls: self.tls == TlsMode::Required,
            authenticated_as: self
                .credentials
                .as_ref()
                .map(|credentials| credentials.username.clone()),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            local_address: None,
            helo_name: "localhost".into(),
            protocol: Protocol::Smtp,
            tls: TlsMode::Opportunistic,
            pipelining: PipeliningMode::Opportunistic,
            credentials: None,
        }
    }
}

/// Builder for [`DeliveryConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfigBuilder {
    connect_timeout: Duration,
    response_timeout: Duration,
    local_address: Option<SocketAddr>,
    helo_name: String,
    protocol: Protocol,
    tls: TlsMode,
    pipelining: PipeliningMode,
    credentials: Option<Credentials>,
}

impl Default for DeliveryConfigBuilder {
    fn default() -> Self {
        let defaults = DeliveryConfig::default();
        Self {
            connect_timeout: defaults.connect_timeout,
            response_timeout: defaults.response_timeout,
            local_address: defaults.local_address,
            helo_name: defaults.helo_name,
            protocol: defaults.protocol,
            tls: defaults.tls,
            pipelining: defaults.pipelining,
            credentials: defaults.credentials,
        }
    }
}

impl DeliveryConfigBuilder {
    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-reply timeout.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the local address to bind.
    #[must_use]
    pub const fn local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Sets the EHLO/HELO/LHLO name.
    #[must_use]
    pub fn helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = name.into();
        self
    }

    /// Sets the protocol dialect.
    #[must_use]
    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the STARTTLS policy.
    #[must_use]
    pub const fn tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the pipelining policy.
    #[must_use]
    pub const fn pipelining(mut self, mode: PipeliningMode) -> Self {
        self.pipelining = mode;
        self
    }

    /// Sets AUTH credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if LMTP is combined with a pipelining
    /// mode other than `Required`, the HELO name is empty or malformed, a
    /// timeout is zero, or the credentials use an unsupported mechanism.
    pub fn build(self) -> Result<DeliveryConfig> {
        if self.protocol == Protocol::Lmtp && self.pipelining != PipeliningMode::Required {
            return Err(Error::InvalidConfig(
                "LMTP requires pipelining mode Required".into(),
            ));
        }

        if self.helo_name.is_empty() || self.helo_name.chars().any(char::is_whitespace) {
            return Err(Error::InvalidConfig(format!(
                "Invalid HELO name: {:?}",
                self.helo_name
            )));
        }

        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(Error::InvalidConfig("Timeouts must be non-zero".into()));
        }

        if let Some(credentials) = &self.credentials {
            if !matches!(
                credentials.mechanism,
                AuthMechanism::Plain | AuthMechanism::Login
            ) {
                return Err(Error::InvalidConfig(format!(
                    "Unsupported AUTH mechanism {}",
                    credentials.mechanism
                )));
            }
            if credentials.username.is_empty() {
                return Err(Error::InvalidConfig("Empty AUTH username".into()));
            }
        }

        Ok(DeliveryConfig {
            connect_timeout: self.connect_timeout,
            response_timeout: self.response_timeout,
            local_address: self.local_address,
            helo_name: self.helo_name,
            protocol: self.protocol,
            tls: self.tls,
            pipelining: self.pipelining,
            credentials: self.credentials,
        })
    }
}

impl TryFrom<DeliveryConfigBuilder> for DeliveryConfig {
    type Error = Error;

    fn try_from(builder: DeliveryConfigBuilder) -> Result<Self> {
        builder.build()
    }
}
