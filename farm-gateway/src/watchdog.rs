//! Periodic `update_watchdog = 1` broadcast, pushed onto the transfer queue.
//!
//! The watchdog never touches the serial ports: the relay writes its frames
//! with everything else.

use crate::logging::LogContext;
use crate::relay::{QueueError, TransferQueue};
use farm_protocol::{encode_command, Uid};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WATCHDOG_ACTION: &str = "update_watchdog";

pub struct Watchdog {
    uid: Uid,
    interval: Duration,
    queue: TransferQueue,
    log: LogContext,
}

impl Watchdog {
    pub fn new(uid: Uid, interval: Duration, queue: TransferQueue, log: LogContext) -> Self {
        Self { uid, interval, queue, log }
    }

    /// Queues one watchdog frame. A full queue skips this beat.
    pub fn beat(&self) -> Result<(), QueueError> {
        let frame = match encode_command(self.uid, WATCHDOG_ACTION, 1) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(parent: self.log.span(), error = %e, "watchdog frame not encoded");
                return Ok(());
            }
        };
        debug!(parent: self.log.span(), hex = %frame.hex, "watchdog queued");
        self.queue.try_push(frame)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(parent: self.log.span(), uid = %self.uid, interval = ?self.interval, "watchdog started");
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(parent: self.log.span(), "watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            match self.beat() {
                Ok(()) => {}
                Err(QueueError::Closed) => {
                    warn!(parent: self.log.span(), "transfer queue closed, watchdog stopped");
                    return;
                }
                Err(e) => warn!(parent: self.log.span(), error = %e, "watchdog beat skipped"),
            }
        }
    }
}
