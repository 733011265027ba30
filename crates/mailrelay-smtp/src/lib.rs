//! # mailrelay-smtp
//!
//! SMTP/LMTP protocol plumbing for the mailrelay delivery client.
//!
//! ## Features
//!
//! - **Protocol types**: reply codes, multi-line replies, service extensions,
//!   negotiated capabilities, envelope addresses
//! - **Commands**: EHLO/LHLO/HELO, STARTTLS, AUTH, MAIL FROM, RCPT TO, DATA,
//!   RSET, QUIT, plus dot-stuffed message body encoding
//! - **Transport contract**: the [`Transport`] and [`Session`] traits the
//!   delivery state machine drives, with a close-signalling
//!   [`SessionHandle`]
//! - **TCP/TLS transport**: [`TcpTransport`] with STARTTLS upgrades via rustls
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailrelay_smtp::{Command, ConnectOptions, Destination, Session, TcpTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() -> mailrelay_smtp::Result<()> {
//!     let transport = TcpTransport::new();
//!     let destination: Destination = "mx.example.com:25".parse()?;
//!     let connection = transport.connect(&destination, &ConnectOptions::default()).await?;
//!
//!     let mut session = connection.session;
//!     session.send(&Command::Ehlo { hostname: "client.example.com".into() }).await?;
//!     let reply = session.read_reply().await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP command builders and body encoding
//! - [`connection`]: Transport/session contract and TCP implementation
//! - [`parser`]: Reply parser
//! - [`types`]: Core SMTP types (addresses, extensions, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use command::{BodyType, Command};
pub use connection::{
    ConnectOptions, Connection, Session, SessionHandle, SmtpSession, TcpTransport, Transport,
};
pub use error::{Error, Result};
pub use types::{
    Address, AuthMechanism, Capabilities, Destination, Extension, Reply, ReplyCode, SMTP_PORT,
};
