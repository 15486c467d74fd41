//! Chat transports and the status HTTP surface.
//!
//! The bot talks to exactly one transport at a time through the
//! [`ChatTransport`] trait. [`MatrixChannel`] is the production
//! implementation.

mod channel;
mod matrix;
mod status_server;

pub use channel::{ChatTransport, EventStream, InboundEvent, TransportEvent};
pub use matrix::MatrixChannel;
pub use status_server::{StatusServer, StatusServerConfig};
