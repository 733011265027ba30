//! Connections: the transport/session contract and its TCP implementation.

mod handle;
mod session;
mod stream;
mod transport;

pub use handle::SessionHandle;
pub use session::{SmtpSession, TcpTransport};
pub use stream::{SmtpStream, default_tls_connector};
pub use transport::{ConnectOptions, Connection, Session, Transport};
