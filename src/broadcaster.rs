//! Periodic push of the active module's payload to time-channel clients.

use crate::module::Module;
use crate::registry::ClientRegistry;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::trace;

/// Default tick period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A recurring timer. Each deadline is set relative to the previous fire;
/// dropping the broadcaster cancels it.
#[derive(Debug)]
pub struct PeriodicBroadcaster {
    interval: Interval,
}

impl PeriodicBroadcaster {
    /// Must be called inside a Tokio runtime. The first tick is one `period`
    /// from now.
    pub fn start(period: Duration) -> Self {
        // `interval_at` rejects a zero period.
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Waits for the next deadline.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Broadcasts the current payload and returns how many clients took it.
    /// Nothing is sent if there is no listener, no module or no payload.
    pub fn fire(module: Option<&dyn Module>, registry: &ClientRegistry) -> usize {
        if registry.is_empty() {
            return 0;
        }
        let Some(payload) = module.and_then(|m| m.push_payload()) else {
            trace!("No payload this tick");
            return 0;
        };
        registry.broadcast(&payload)
    }
}
