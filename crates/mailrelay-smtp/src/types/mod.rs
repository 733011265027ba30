//! Core SMTP types.

mod address;
mod capabilities;
mod destination;
mod extension;
mod reply;

pub use address::Address;
pub use capabilities::Capabilities;
pub use destination::{Destination, SMTP_PORT};
pub use extension::{AuthMechanism, Extension};
pub use reply::{Reply, ReplyCode};
