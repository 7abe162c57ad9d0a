//! Periodic position publication.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mmtp_core::{ConnectionMessage, PositionTime};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bus::MessageBus;

/// Where the client currently is, according to the application.
pub type PositionSupplier = Box<dyn Fn() -> Option<PositionTime> + Send + Sync>;

/// Wraps the application's position supplier and remembers the last good
/// reading, so a hiccup in the supplier re-sends the previous position
/// instead of going silent.
pub struct PositionTracker {
    supplier: PositionSupplier,
    last: Mutex<Option<PositionTime>>,
}

impl PositionTracker {
    pub(crate) fn new(supplier: PositionSupplier) -> Arc<Self> {
        Arc::new(Self {
            supplier,
            last: Mutex::new(None),
        })
    }

    /// The freshest position available: the supplier's reading, or the
    /// previous one when the supplier has nothing.
    pub fn current(&self) -> Option<PositionTime> {
        let mut last = self.last.lock().expect("position cache poisoned");
        match (self.supplier)() {
            Some(reading) => {
                *last = Some(reading);
                Some(reading)
            }
            None => *last,
        }
    }

    /// Starts the periodic reporter. A cycle with no position at all is
    /// skipped.
    pub(crate) fn spawn_reporter(
        self: &Arc<Self>,
        bus: Arc<MessageBus>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(position) = tracker.current() else {
                    trace!("no position to report, skipping cycle");
                    continue;
                };
                if let Err(e) = bus.send_one_way(ConnectionMessage::PositionReport { position }) {
                    // reconnect in progress or queue full; the next cycle
                    // will carry a fresher reading anyway
                    debug!("position report not sent: {e}");
                }
            }
        })
    }
}
