//! IoT device triggers fired when a timer expires.

mod particle;

pub use particle::ParticleClient;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DeviceConfig;
use crate::error::DeviceError;

/// Argument sent with a timer-expiry trigger.
pub const DEFAULT_TRIGGER_ARGUMENT: &str = "triggered";

/// A remote device function that can be invoked.
#[async_trait]
pub trait DeviceTrigger: Send + Sync {
    /// Invoke the function with `argument` and return its reported value.
    async fn invoke(&self, argument: &str) -> Result<String, DeviceError>;
}

/// Create the device trigger, or `None` when no device is configured.
pub fn create_device_trigger(config: &DeviceConfig) -> Option<Arc<dyn DeviceTrigger>> {
    match ParticleClient::new(config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!("{}, timer expiry will only notify the room", e);
            None
        }
    }
}
