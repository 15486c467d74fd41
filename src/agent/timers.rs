//! In-memory timers with exactly-once expiry.
//!
//! Each timer is a spawned task keyed by id in the registry. Whoever removes
//! the entry first owns it: the firing task removes it before notifying, and
//! `cancel` removes it before aborting the task, so a timer is either fired or
//! cancelled and never both.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channels::ChatTransport;
use crate::device::{DEFAULT_TRIGGER_ARGUMENT, DeviceTrigger};
use crate::error::TimerError;

/// Text posted to the room when a timer fires.
pub const TIMER_EXPIRED_MESSAGE: &str = "Timer expired!";

/// Attempts at a short time-based id before falling back to a UUID suffix.
const MAX_ID_ATTEMPTS: usize = 16;

/// Unique timer identifier, e.g. `timer_1718000000_4821`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TimerId(String);

impl TimerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public view of a pending timer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerInfo {
    pub id: TimerId,
    pub room_id: String,
    pub duration_seconds: u64,
    pub scheduled_at: DateTime<Utc>,
    pub fires_at: DateTime<Utc>,
}

struct TimerEntry {
    info: TimerInfo,
    task: JoinHandle<()>,
}

type Entries = Arc<Mutex<HashMap<TimerId, TimerEntry>>>;

/// Sends the expiry notifications.
struct ExpiryNotifier {
    transport: Arc<dyn ChatTransport>,
    device: Option<Arc<dyn DeviceTrigger>>,
}

impl ExpiryNotifier {
    async fn notify(&self, info: &TimerInfo) {
        tracing::info!("Timer {} expired for room {}!", info.id, info.room_id);

        if let Some(device) = &self.device {
            if let Err(e) = device.invoke(DEFAULT_TRIGGER_ARGUMENT).await {
                tracing::error!("Device trigger for timer {} failed: {}", info.id, e);
            }
        }

        match self
            .transport
            .send_message(&info.room_id, TIMER_EXPIRED_MESSAGE)
            .await
        {
            Ok(()) => tracing::info!("Sent timer expiration message to room {}", info.room_id),
            Err(e) => tracing::error!("Error sending timer expiration message: {}", e),
        }
    }
}

/// Owns every pending timer.
pub struct TimerRegistry {
    entries: Entries,
    notifier: Arc<ExpiryNotifier>,
    closed: AtomicBool,
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<TimerId, TimerEntry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

impl TimerRegistry {
    /// Create a registry that reports expiry through `transport` and, if
    /// present, `device`.
    pub fn new(transport: Arc<dyn ChatTransport>, device: Option<Arc<dyn DeviceTrigger>>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            notifier: Arc::new(ExpiryNotifier { transport, device }),
            closed: AtomicBool::new(false),
        }
    }

    /// Schedule a timer and return its id without waiting for it.
    pub fn schedule(&self, duration_seconds: u64, room_id: &str) -> Result<TimerId, TimerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TimerError::ShutDown);
        }

        let out_of_range = || TimerError::DurationOutOfRange {
            seconds: duration_seconds,
        };
        let delta = i64::try_from(duration_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(out_of_range)?;
        let scheduled_at = Utc::now();
        let fires_at = scheduled_at
            .checked_add_signed(delta)
            .ok_or_else(out_of_range)?;

        let mut entries = lock(&self.entries);
        let id = unique_id(&entries, scheduled_at);
        let info = TimerInfo {
            id: id.clone(),
            room_id: room_id.to_string(),
            duration_seconds,
            scheduled_at,
            fires_at,
        };

        // Spawned while the map is locked, so the entry is in place before the
        // task can look for it.
        let task = {
            let entries = Arc::clone(&self.entries);
            let notifier = Arc::clone(&self.notifier);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(duration_seconds)).await;
                let removed = lock(&entries).remove(&id);
                let Some(entry) = removed else {
                    tracing::debug!("Timer {} was cancelled before firing", id);
                    return;
                };
                notifier.notify(&entry.info).await;
            })
        };

        tracing::info!(
            "Setting timer {} for {} seconds in room {}",
            id,
            duration_seconds,
            room_id
        );
        entries.insert(id.clone(), TimerEntry { info, task });
        Ok(id)
    }

    /// Cancel a pending timer. Returns false if it already fired or never existed.
    pub fn cancel(&self, id: &TimerId) -> bool {
        let Some(entry) = lock(&self.entries).remove(id) else {
            return false;
        };
        entry.task.abort();
        tracing::info!("Cancelled timer {}", id);
        true
    }

    /// Snapshot of pending timers, soonest first.
    pub fn active(&self) -> Vec<TimerInfo> {
        let mut timers: Vec<TimerInfo> = lock(&self.entries)
            .values()
            .map(|e| e.info.clone())
            .collect();
        timers.sort_by(|a, b| a.fires_at.cmp(&b.fires_at).then_with(|| a.id.0.cmp(&b.id.0)));
        timers
    }

    pub fn get(&self, id: &TimerId) -> Option<TimerInfo> {
        lock(&self.entries).get(id).map(|e| e.info.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending timer and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<TimerEntry> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.task.abort();
        }
        if !drained.is_empty() {
            tracing::info!("Dropped {} pending timers on shutdown", drained.len());
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for entry in lock(&self.entries).values() {
            entry.task.abort();
        }
    }
}

fn unique_id(entries: &HashMap<TimerId, TimerEntry>, now: DateTime<Utc>) -> TimerId {
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = TimerId(format!(
            "timer_{}_{}",
            now.timestamp(),
            rng.gen_range(1000..=9999)
        ));
        if !entries.contains_key(&id) {
            return id;
        }
    }
    TimerId(format!("timer_{}_{}", now.timestamp(), Uuid::new_v4().simple()))
}
