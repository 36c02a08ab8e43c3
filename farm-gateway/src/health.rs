use crate::config::Profile;
use crate::serial::SerialPorts;
use crate::state::{new_shared, snapshot, Shared};
use crate::transport::{ConnectionSet, ConnectionState, LinkClient};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct LinkHealth {
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnects: u32,
}

#[derive(Debug, Serialize)]
pub struct GatewayHealth {
    pub profile: Profile,
    pub uptime_seconds: u64,
    pub serial_ports: Vec<String>,
    pub upstream_status: String,
    pub upstream_failures: u32,
    pub frames_written: u64,
    pub outbound_links: Vec<LinkHealth>,
    pub inbound_peers: usize,
}

/// Counters fed by the relay, read by the dashboard.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    upstream_status: Shared<String>,
    upstream_failures: Arc<AtomicU32>,
    frames_written: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            upstream_status: new_shared("connected".to_string()),
            upstream_failures: Arc::new(AtomicU32::new(0)),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_upstream_connected(&self) {
        *self.upstream_status.lock() = "connected".to_string();
    }

    pub fn mark_upstream_degraded(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        *self.upstream_status.lock() = "degraded".to_string();
    }

    pub fn upstream_failures(&self) -> u32 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn record_frame_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn get_health(
        &self,
        profile: Profile,
        ports: &SerialPorts,
        links: &[LinkClient],
        inbound: &ConnectionSet,
    ) -> GatewayHealth {
        GatewayHealth {
            profile,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            serial_ports: ports.names(),
            upstream_status: snapshot(&self.upstream_status),
            upstream_failures: self.upstream_failures(),
            frames_written: self.frames_written(),
            outbound_links: links
                .iter()
                .map(|link| LinkHealth {
                    endpoint: link.endpoint().to_string(),
                    state: link.state(),
                    reconnects: link.reconnects(),
                })
                .collect(),
            inbound_peers: inbound.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_follows_marks() {
        let health = HealthTracker::new();
        health.mark_upstream_degraded();
        health.mark_upstream_degraded();
        health.record_frame_written();

        let report = health.get_health(Profile::Master, &SerialPorts::default(), &[], &ConnectionSet::default());
        assert_eq!(report.upstream_status, "degraded");
        assert_eq!(report.upstream_failures, 2);
        assert_eq!(report.frames_written, 1);

        health.mark_upstream_connected();
        let report = health.get_health(Profile::Master, &SerialPorts::default(), &[], &ConnectionSet::default());
        assert_eq!(report.upstream_status, "connected");
        assert!(report.outbound_links.is_empty());
    }
}
