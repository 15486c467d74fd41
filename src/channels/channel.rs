//! Chat transport trait and event types.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;

use crate::error::ChannelError;

/// A text message delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Fully qualified sender identity (e.g. `@alice:matrix.org`).
    pub sender_id: String,
    /// Room the message was posted in.
    pub room_id: String,
    /// Message text.
    pub body: String,
    /// Server-assigned origin timestamp.
    pub server_timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        sender_id: impl Into<String>,
        room_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            room_id: room_id.into(),
            body: body.into(),
            server_timestamp: Utc::now(),
        }
    }

    /// Set the server timestamp.
    pub fn at(mut self, server_timestamp: DateTime<Utc>) -> Self {
        self.server_timestamp = server_timestamp;
        self
    }

    /// Set the server timestamp from epoch milliseconds, as carried on the wire.
    ///
    /// Out-of-range values clamp to the epoch so they read as historical.
    pub fn at_millis(self, millis: i64) -> Self {
        let ts = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH);
        self.at(ts)
    }
}

/// Something the transport wants the bot to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A room text message.
    Message(InboundEvent),
    /// The transport finished its first (backfill) sync.
    SyncComplete,
}

/// Stream of transport events. Ends when the transport hits an unrecoverable error.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// A federated chat transport.
///
/// Implementations own their session state; `login` must succeed before any
/// other call.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Authenticate and return the bot's own identity.
    async fn login(&self) -> Result<String, ChannelError>;

    /// Join a room by alias or id and return the canonical room id.
    async fn join_room(&self, alias: &str) -> Result<String, ChannelError>;

    /// Post a plain text message to a room.
    async fn send_message(&self, room_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Start polling for events.
    ///
    /// The first poll replays the backlog and is followed by
    /// `TransportEvent::SyncComplete`. The stream keeps running until the
    /// transport fails in a way it cannot recover from.
    async fn start(&self, poll_interval: Duration) -> Result<EventStream, ChannelError>;

    /// Gracefully stop polling.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_millis() {
        let event = InboundEvent::new("@a:x", "!r:x", "hi").at_millis(1_700_000_000_123);
        assert_eq!(event.server_timestamp.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_at_millis_out_of_range_is_epoch() {
        let event = InboundEvent::new("@a:x", "!r:x", "hi").at_millis(i64::MAX);
        assert_eq!(event.server_timestamp, DateTime::UNIX_EPOCH);
    }
}
