//! TCP/TLS implementation of [`Transport`] and [`Session`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;

use super::stream::default_tls_connector;
use super::{ConnectOptions, Connection, Session, SessionHandle, SmtpStream, Transport};
use crate::command::{Command, encode_message};
use crate::error::{Error, Result};
use crate::types::{Capabilities, Destination, Reply};

/// Session over a TCP connection, optionally upgraded with STARTTLS.
pub struct SmtpSession {
    stream: Option<SmtpStream>,
    destination: Destination,
    handle: SessionHandle,
    connector: TlsConnector,
    tls_timeout: Duration,
    capabilities: Capabilities,
    authenticated_user: Option<String>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl SmtpSession {
    fn stream_mut(&mut self) -> Result<&mut SmtpStream> {
        if self.handle.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.stream.as_mut().ok_or(Error::ConnectionClosed)
    }
}

impl Session for SmtpSession {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    fn is_encrypted(&self) -> bool {
        self.stream.as_ref().is_some_and(SmtpStream::is_encrypted)
    }

    fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    fn set_authenticated_user(&mut self, user: Option<String>) {
        self.authenticated_user = user;
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        tracing::trace!(destination = %self.destination, %command, "C:");
        self.stream_mut()?.write_all(&command.serialize()).await
    }

    async fn send_message(&mut self, message: &[u8]) -> Result<()> {
        tracing::trace!(destination = %self.destination, bytes = message.len(), "C: <message>");
        let encoded = encode_message(message);
        self.stream_mut()?.write_all(&encoded).await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let reply = self.stream_mut()?.read_reply().await?;
        tracing::trace!(destination = %self.destination, %reply, "S:");
        Ok(reply)
    }

    async fn start_tls(&mut self) -> Result<()> {
        if self.handle.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let stream = self.stream.take().ok_or(Error::ConnectionClosed)?;
        let upgrade = stream.upgrade_to_tls(&self.connector, self.destination.host());
        let upgraded = tokio::time::timeout(self.tls_timeout, upgrade)
            .await
            .map_err(|_| Error::Timeout(format!("TLS handshake with {}", self.destination)))??;

        tracing::debug!(destination = %self.destination, "TLS established");
        self.stream = Some(upgraded);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.handle.close();
    }
}

impl std::fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("destination", &self.destination)
            .field("encrypted", &self.is_encrypted())
            .field("closed", &self.handle.is_closed())
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Drop for SmtpSession {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Opens plain TCP connections; STARTTLS upgrades use the configured TLS
/// client configuration.
#[derive(Clone)]
pub struct TcpTransport {
    connector: TlsConnector,
}

impl TcpTransport {
    /// Creates a transport trusting the webpki root certificates.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connector: default_tls_connector(),
        }
    }

    /// Creates a transport using a caller-supplied TLS configuration.
    #[must_use]
    pub fn with_tls_config(config: std::sync::Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    async fn open(destination: &Destination, options: &ConnectOptions) -> Result<TcpStream> {
        let target = (destination.host(), destination.port());
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target).await?.collect();

        let mut last_error = None;
        for addr in addrs {
            // Only try addresses of the same family as the bind address.
            if let Some(local) = options.local_address
                && local.is_ipv4() != addr.is_ipv4()
            {
                continue;
            }

            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(local) = options.local_address {
                socket.bind(local)?;
            }

            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%destination, %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or_else(
            || Error::InvalidDestination(format!("No usable address for {destination}")),
            Error::Io,
        ))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").finish_non_exhaustive()
    }
}

impl Transport for TcpTransport {
    type Session = SmtpSession;

    async fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Connection<SmtpSession>> {
        let timeout = options.connect_timeout;
        let connect = async {
            let tcp = Self::open(destination, options).await?;
            let local_addr = tcp.local_addr().ok();
            let remote_addr = tcp.peer_addr().ok();
            let mut stream = SmtpStream::tcp(tcp);
            let greeting = stream.read_reply().await?;
            Ok::<_, Error>((stream, greeting, local_addr, remote_addr))
        };

        let (stream, greeting, local_addr, remote_addr) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::Timeout(format!("Connecting to {destination}")))??;

        tracing::debug!(%destination, ?remote_addr, greeting = %greeting, "Connected");

        let session = SmtpSession {
            stream: Some(stream),
            destination: destination.clone(),
            handle: SessionHandle::new(),
            connector: self.connector.clone(),
            tls_timeout: timeout,
            capabilities: Capabilities::default(),
            authenticated_user: None,
            local_addr,
            remote_addr,
        };
        Ok(Connection::fresh(session, greeting))
    }
}
