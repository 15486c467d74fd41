//! Gate between backlog replay and live traffic.
//!
//! The transport signals the end of its first sync asynchronously, and startup
//! also marks sync complete explicitly in case that signal is late. Both paths
//! go through [`SyncGate::mark_sync_complete`], whose check-and-set happens
//! under the watch channel's lock, so the cutoff is recorded exactly once.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Tracks whether the initial sync has finished and when.
#[derive(Debug)]
pub struct SyncGate {
    cutoff: watch::Sender<Option<DateTime<Utc>>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self {
            cutoff: watch::Sender::new(None),
        }
    }

    /// Record that the initial sync is done.
    ///
    /// The first call sets the cutoff to now and returns true; every later
    /// call leaves it untouched and returns false.
    pub fn mark_sync_complete(&self) -> bool {
        let mut recorded = None;
        let won = self.cutoff.send_if_modified(|cutoff| {
            if cutoff.is_some() {
                return false;
            }
            let now = Utc::now();
            *cutoff = Some(now);
            recorded = Some(now);
            true
        });

        if let Some(now) = recorded {
            tracing::info!("Initial sync complete, connection cutoff set to {}", now);
            tracing::info!("Bot will now only respond to new messages from this point forward.");
        }
        won
    }

    /// The live cutoff, once set.
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        *self.cutoff.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.cutoff().is_some()
    }

    /// Whether an event stamped `timestamp` predates going live.
    ///
    /// Everything counts as stale until the gate opens.
    pub fn is_stale(&self, timestamp: DateTime<Utc>) -> bool {
        match self.cutoff() {
            Some(cutoff) => timestamp <= cutoff,
            None => true,
        }
    }

    /// Wait until the gate opens and return the cutoff.
    pub async fn wait_live(&self) -> DateTime<Utc> {
        let mut rx = self.cutoff.subscribe();
        let cutoff = match rx.wait_for(Option::is_some).await {
            Ok(value) => *value,
            // Unreachable while `self` owns the sender.
            Err(_) => None,
        };
        cutoff.unwrap_or_else(Utc::now)
    }
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}
