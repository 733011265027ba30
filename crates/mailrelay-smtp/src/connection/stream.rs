//! Low-level SMTP stream handling.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore},
};

use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::Reply;

/// Longest reply line accepted before the peer is considered broken.
const MAX_LINE_LENGTH: usize = 4096;

/// Most lines accepted in one multi-line reply.
const MAX_REPLY_LINES: usize = 512;

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Tcp(BufReader<TcpStream>),
    /// TLS-encrypted connection.
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl SmtpStream {
    /// Wraps a connected TCP stream.
    #[must_use]
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Reads a line from the stream, without its line ending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] at end of stream, or an error if
    /// the read fails or the line is unreasonably long.
    pub async fn read_line(&mut self) -> Result<String> {
        match self {
            Self::Tcp(reader) => read_bounded_line(reader).await,
            Self::Tls(reader) => read_bounded_line(&mut **reader).await,
        }
    }

    /// Reads one complete reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the reply is malformed.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }

            let is_last = is_last_reply_line(&line);
            lines.push(line);

            if is_last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol(format!(
                    "Reply exceeds {MAX_REPLY_LINES} lines"
                )));
            }
        }

        parse_reply(&lines)
    }

    /// Writes data to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    /// Upgrades a TCP stream to TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already encrypted, if the reader
    /// holds unread bytes (a STARTTLS injection attempt) or if the TLS
    /// handshake fails.
    pub async fn upgrade_to_tls(self, connector: &TlsConnector, hostname: &str) -> Result<Self> {
        let reader = match self {
            Self::Tcp(reader) => reader,
            Self::Tls(_) => return Err(Error::InvalidState("Already using TLS".into())),
        };

        if !reader.buffer().is_empty() {
            return Err(Error::Protocol(
                "Server sent data after the STARTTLS reply".into(),
            ));
        }

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| Error::InvalidDestination(format!("Invalid hostname: {hostname}")))?;

        let tls_stream = connector.connect(server_name, reader.into_inner()).await?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }
}

/// Reads one line, buffering at most [`MAX_LINE_LENGTH`] bytes plus the
/// newline.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Err(Error::ConnectionClosed);
    }
    if !buf.ends_with(b"\n") && buf.len() > MAX_LINE_LENGTH {
        return Err(Error::Protocol(format!(
            "Reply line exceeds {MAX_LINE_LENGTH} bytes"
        )));
    }

    let line = String::from_utf8(buf)
        .map_err(|_| Error::Protocol("Reply line is not valid UTF-8".into()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Creates a TLS connector with the webpki root certificates.
#[must_use]
pub fn default_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
