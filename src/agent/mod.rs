//! Core bot logic.
//!
//! The agent orchestrates:
//! - Filtering inbound room traffic against the live cutoff
//! - Relaying admitted messages through the completion client
//! - Recognizing timer directives in model replies
//! - Scheduling timers and notifying the room and device on expiry

mod intent;
mod router;
mod sync_gate;
mod timers;

pub use intent::{Intent, IntentParser};
pub use router::{DropReason, MessageRouter, RouteOutcome, RouterState};
pub use sync_gate::SyncGate;
pub use timers::{TIMER_EXPIRED_MESSAGE, TimerId, TimerInfo, TimerRegistry};
