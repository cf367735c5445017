//! Periodic sampler
//!
//! Drives [`SignalRegistry::read_all_active`] on a fixed interval and publishes
//! the whole snapshot whenever any value differs from the previous one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::signal::registry::ValueMap;
use crate::signal::SignalRegistry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Keep the interval inside the supported window
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    /// Polling switched on (`true`) or off (`false`)
    PollingChanged(bool),
    /// Full snapshot after a change, not a delta
    ValuesChanged(Arc<ValueMap>),
}

struct Shared {
    registry: Arc<SignalRegistry>,
    snapshot: Mutex<Arc<ValueMap>>,
    events: broadcast::Sender<PollerEvent>,
}

impl Shared {
    async fn tick(&self) -> bool {
        if !self.registry.transport().is_connected() {
            trace!("Poll skipped: not connected");
            return false;
        }

        let values = self.registry.read_all_active().await;
        let current = {
            let mut snapshot = self.snapshot.lock();
            if **snapshot == values {
                return false;
            }
            let next = Arc::new(values);
            *snapshot = Arc::clone(&next);
            next
        };

        debug!("Snapshot changed ({} values)", current.len());
        let _ = self.events.send(PollerEvent::ValuesChanged(current));
        true
    }
}

struct TaskState {
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

pub struct Poller {
    shared: Arc<Shared>,
    state: Mutex<TaskState>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("polling", &self.is_polling())
            .field("interval", &self.interval())
            .finish()
    }
}

impl Poller {
    pub fn new(registry: Arc<SignalRegistry>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                registry,
                snapshot: Mutex::new(Arc::new(ValueMap::new())),
                events,
            }),
            state: Mutex::new(TaskState {
                handle: None,
                interval: DEFAULT_POLL_INTERVAL,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.state
            .lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Last published snapshot
    pub fn snapshot(&self) -> Arc<ValueMap> {
        Arc::clone(&self.shared.snapshot.lock())
    }

    /// Start ticking every `interval` (clamped to 50..=1000 ms).
    ///
    /// Returns true when polling was switched on by this call. While already
    /// running only the reported interval changes.
    pub fn start(&self, interval: Duration) -> bool {
        let period = clamp_interval(interval);
        let mut state = self.state.lock();
        state.interval = period;
        if state.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot start polling without a runtime: {}", e);
                return false;
            },
        };

        let shared = Arc::clone(&self.shared);
        state.handle = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                shared.tick().await;
            }
        }));
        drop(state);

        info!("Polling started ({} ms)", period.as_millis());
        let _ = self.shared.events.send(PollerEvent::PollingChanged(true));
        true
    }

    /// Returns true when polling was running
    pub fn stop(&self) -> bool {
        let Some(handle) = self.state.lock().handle.take() else {
            return false;
        };
        let was_running = !handle.is_finished();
        handle.abort();
        if was_running {
            info!("Polling stopped");
            let _ = self.shared.events.send(PollerEvent::PollingChanged(false));
        }
        was_running
    }

    /// Run one sample outside the timer. Returns true when a change was published.
    pub async fn poll_once(&self) -> bool {
        self.shared.tick().await
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            handle.abort();
        }
    }
}
