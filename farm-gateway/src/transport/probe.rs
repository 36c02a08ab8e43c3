//! Liveness probe: a `check_message` on every outbound link, paced, in rounds.
//!
//! The probe only queues. A dead peer shows up as a failed send in the
//! outbox's forwarding task, which then runs the reconnect loop.

use super::{LinkError, Outbox};
use crate::logging::LogContext;
use farm_protocol::Envelope;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LivenessProbe {
    outboxes: Vec<Outbox>,
    interval: Duration,
    pacing: Duration,
    log: LogContext,
}

impl LivenessProbe {
    pub fn new(outboxes: Vec<Outbox>, interval: Duration, pacing: Duration, log: LogContext) -> Self {
        Self { outboxes, interval, pacing, log }
    }

    /// Queues one probe per link. Returns how many were accepted.
    pub async fn round(&self) -> usize {
        let mut sent = 0;
        for outbox in &self.outboxes {
            match outbox.try_send(Envelope::CheckMessage) {
                Ok(()) => sent += 1,
                Err(LinkError::OutboxFull(endpoint)) => {
                    warn!(parent: self.log.span(), %endpoint, "link backlog full, probe skipped")
                }
                Err(e) => debug!(parent: self.log.span(), error = %e, "probe not queued"),
            }
            tokio::time::sleep(self.pacing).await;
        }
        sent
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(parent: self.log.span(), links = self.outboxes.len(), interval = ?self.interval, "liveness probe started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(parent: self.log.span(), "liveness probe stopped");
                    return;
                }
                _ = self.round() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(parent: self.log.span(), "liveness probe stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
