//! Remote endpoint of a delivery.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Default SMTP relay port.
pub const SMTP_PORT: u16 = 25;

/// Host and port of a remote SMTP/LMTP server.
///
/// Used both to open connections and as the key for pooled sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Creates a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::InvalidDestination("Host cannot be empty".into()));
        }
        Ok(Self { host, port })
    }

    /// Returns the host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Destination {
    type Err = Error;

    /// Parses `host`, `host:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidDestination(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, s)?,
                None if tail.is_empty() => SMTP_PORT,
                None => return Err(Error::InvalidDestination(s.to_string())),
            };
            return Self::new(host, port);
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Self::new(host, parse_port(port, s)?),
            Some(_) => Err(Error::InvalidDestination(format!(
                "IPv6 literal must be bracketed: {s}"
            ))),
            None => Self::new(s, SMTP_PORT),
        }
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::InvalidDestination(format!("Invalid port in {input}")))
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
