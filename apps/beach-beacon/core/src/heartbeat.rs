//! Per-connection liveness timers.
//!
//! Each registered connection gets its own Tokio task that wakes on a fixed
//! interval and hands control to a tick callback. The callback decides whether
//! the timer keeps running; the registry owns the [`HeartbeatHandle`] and
//! cancels it on every removal path.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Returned by a tick callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn a timer that calls `tick` once per interval until it returns
    /// [`Beat::Stop`] or the handle is cancelled. The first tick fires one full
    /// interval after start. Must be called from within a Tokio runtime.
    pub(crate) fn start<F>(&self, mut tick: F) -> HeartbeatHandle
    where
        F: FnMut() -> Beat + Send + 'static,
    {
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tick() == Beat::Stop {
                    break;
                }
            }
        });
        HeartbeatHandle { task }
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

/// Cancellation handle for one heartbeat timer. Consumed by [`cancel`], so a
/// timer can only be torn down once.
///
/// [`cancel`]: HeartbeatHandle::cancel
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn cancel(self) {
        self.task.abort();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
