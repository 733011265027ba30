//! # mailrelay-delivery
//!
//! Asynchronous SMTP/LMTP delivery with per-recipient results.
//!
//! ## Features
//!
//! - **Delivery state machine**: greeting, EHLO/LHLO with HELO fallback,
//!   STARTTLS, AUTH PLAIN/LOGIN, and MAIL/RCPT/DATA for several envelopes over
//!   one session, pipelined when the server allows it
//! - **Per-recipient outcomes**: every recipient gets a [`RecipientStatus`]
//!   classified from the reply that decided it
//! - **Delivery futures**: [`DeliveryFuture`] can be awaited, blocked on with
//!   a timeout, observed through listeners, or cancelled
//! - **Connection control**: [`ConnectionLimiter`] bounds concurrent sessions
//!   with a FIFO wait queue, [`SessionPool`] reuses idle sessions
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailrelay_delivery::{Deliverer, DeliveryConfig, Envelope};
//! use mailrelay_smtp::{Address, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let deliverer = Deliverer::new(TcpTransport::new());
//!     let config = DeliveryConfig::builder()
//!         .helo_name("relay.example.com")
//!         .build()?;
//!
//!     let envelope = Envelope::new(
//!         Some(Address::new("alice@example.com")?),
//!         [Address::new("bob@example.org")?],
//!         "Subject: Hello\r\n\r\nHi Bob!\r\n",
//!     )?;
//!
//!     let future = deliverer.deliver(&"mx.example.org".parse()?, &config, [envelope])?;
//!     for result in future.results().await?.iter() {
//!         println!("{result:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`machine`]: Sans-IO delivery state machine
//! - [`cursor`]: Envelope and recipient progress for one session
//! - [`limiter`]: Connection admission control
//! - [`pool`]: Idle session reuse

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
pub mod cursor;
mod deliver;
mod envelope;
mod error;
mod future;
pub mod limiter;
pub mod machine;
pub mod pool;
mod status;

pub use config::{
    Credentials, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, DeliveryConfig,
    DeliveryConfigBuilder, PipeliningMode, Protocol, TlsMode,
};
pub use deliver::{Deliverer, deliver};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use future::{Completion, DeliveryFuture, ListenerId};
pub use limiter::ConnectionLimiter;
pub use pool::SessionPool;
pub use status::{DeliveryResult, Outcome, RecipientStatus, classify};
