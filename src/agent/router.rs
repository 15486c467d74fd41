//! The message control loop.
//!
//! Every inbound message passes the same filters before anything costs an API
//! call: nothing is handled before the initial sync completes, the bot never
//! answers itself, and anything stamped at or before the live cutoff is
//! backlog. What survives goes to the completion client, and the reply is
//! either relayed or turned into a timer.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinSet;

use crate::agent::intent::{Intent, IntentParser};
use crate::agent::sync_gate::SyncGate;
use crate::agent::timers::{TimerId, TimerRegistry};
use crate::channels::{ChatTransport, EventStream, InboundEvent, TransportEvent};
use crate::llm::CompletionClient;

/// Where the router is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// The first sync has not finished; every message is dropped.
    AwaitingInitialSync,
    /// The cutoff is set; messages stamped after it are handled.
    Live,
}

/// Why an event was not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived before the initial sync completed.
    AwaitingInitialSync,
    /// Sent by the bot itself.
    OwnMessage,
    /// Stamped at or before the live cutoff.
    Stale,
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Dropped(DropReason),
    /// A reply was produced and handed to the transport.
    Replied {
        text: String,
        timer: Option<TimerId>,
    },
}

/// Routes room messages through the completion client and timer registry.
pub struct MessageRouter {
    bot_user_id: String,
    transport: Arc<dyn ChatTransport>,
    completion: CompletionClient,
    parser: IntentParser,
    timers: Arc<TimerRegistry>,
    gate: Arc<SyncGate>,
}

impl MessageRouter {
    pub fn new(
        bot_user_id: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        completion: CompletionClient,
        timers: Arc<TimerRegistry>,
        gate: Arc<SyncGate>,
    ) -> Self {
        Self {
            bot_user_id: bot_user_id.into(),
            transport,
            completion,
            parser: IntentParser::new(),
            timers,
            gate,
        }
    }

    pub fn state(&self) -> RouterState {
        if self.gate.is_live() {
            RouterState::Live
        } else {
            RouterState::AwaitingInitialSync
        }
    }

    /// Filter and, if admitted, fully handle one event.
    pub async fn handle_event(&self, event: &InboundEvent) -> RouteOutcome {
        if let Some(reason) = self.admit(event) {
            return RouteOutcome::Dropped(reason);
        }
        self.process(event).await
    }

    /// Consume the transport's events until the stream ends.
    ///
    /// Filtering happens in delivery order; each admitted message is then
    /// handled in its own task, so replies may complete out of order.
    pub async fn run(self: Arc<Self>, mut events: EventStream) {
        let mut handlers = JoinSet::new();

        while let Some(event) = events.next().await {
            match event {
                TransportEvent::SyncComplete => {
                    self.gate.mark_sync_complete();
                }
                TransportEvent::Message(event) => {
                    if self.admit(&event).is_some() {
                        continue;
                    }
                    let router = Arc::clone(&self);
                    handlers.spawn(async move {
                        router.process(&event).await;
                    });
                }
            }

            while let Some(finished) = handlers.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!("Message handler panicked: {}", e);
                }
            }
        }

        tracing::warn!("Transport event stream ended, waiting for in-flight messages");
        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                tracing::error!("Message handler panicked: {}", e);
            }
        }
    }

    /// Decide whether an event may be handled. `None` admits it.
    fn admit(&self, event: &InboundEvent) -> Option<DropReason> {
        let Some(cutoff) = self.gate.cutoff() else {
            tracing::debug!(
                "Initial sync not complete, ignoring message from {}",
                event.sender_id
            );
            return Some(DropReason::AwaitingInitialSync);
        };

        if event.sender_id == self.bot_user_id {
            tracing::debug!("Ignoring message from self");
            return Some(DropReason::OwnMessage);
        }

        if event.server_timestamp <= cutoff {
            tracing::debug!(
                "Ignoring old message from {} (timestamp {} <= cutoff {})",
                event.sender_id,
                event.server_timestamp,
                cutoff
            );
            return Some(DropReason::Stale);
        }

        None
    }

    async fn process(&self, event: &InboundEvent) -> RouteOutcome {
        tracing::info!("Received message from {}: {}", event.sender_id, event.body);

        let reply = self.completion.complete(&event.body).await;

        let (text, timer) = match self.parser.parse(&reply) {
            Intent::Timer { seconds } => match self.timers.schedule(seconds, &event.room_id) {
                Ok(id) => (
                    format!(
                        "Timer set for {}. I'll notify you when it expires.",
                        format_duration(seconds)
                    ),
                    Some(id),
                ),
                Err(e) => {
                    tracing::error!("Error setting timer: {}", e);
                    (format!("I couldn't set the timer. Error: {}", e), None)
                }
            },
            Intent::PlainText(text) => (text, None),
        };

        match self.transport.send_message(&event.room_id, &text).await {
            Ok(()) => tracing::info!("Sent response to room {}", event.room_id),
            Err(e) => tracing::error!("Error sending response: {}", e),
        }

        RouteOutcome::Replied { text, timer }
    }
}

/// Human-readable duration that keeps the literal seconds count.
fn format_duration(seconds: u64) -> String {
    if seconds == 1 {
        "1 second".to_string()
    } else {
        format!("{} seconds", seconds)
    }
}
