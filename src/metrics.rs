//! Lightweight Prometheus-compatible metrics for channel establishment.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format for the caller to expose or log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the acceptor and handshake workers during setup.
pub struct Metrics {
    /// Channels currently in ready state (gauge)
    pub channels_ready: AtomicU64,
    /// Total handshakes completed successfully (counter)
    pub handshakes_completed_total: AtomicU64,
    /// Total handshake/establishment failures (counter)
    pub handshake_failures_total: AtomicU64,
    /// Total inbound sockets accepted and matched to a pending peer (counter)
    pub inbound_accepted_total: AtomicU64,
    /// Total inbound sockets rejected as unauthorized (counter)
    pub unauthorized_rejected_total: AtomicU64,
    /// Total outbound dial retries (counter)
    pub connect_retries_total: AtomicU64,
    /// Setup start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            channels_ready: AtomicU64::new(0),
            handshakes_completed_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            inbound_accepted_total: AtomicU64::new(0),
            unauthorized_rejected_total: AtomicU64::new(0),
            connect_retries_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP comm_channels_ready Channels currently in ready state\n\
             # TYPE comm_channels_ready gauge\n\
             comm_channels_ready {}\n\
             # HELP comm_handshakes_completed_total Total handshakes completed\n\
             # TYPE comm_handshakes_completed_total counter\n\
             comm_handshakes_completed_total {}\n\
             # HELP comm_handshake_failures_total Total channel establishment failures\n\
             # TYPE comm_handshake_failures_total counter\n\
             comm_handshake_failures_total {}\n\
             # HELP comm_inbound_accepted_total Total inbound sockets matched to a pending peer\n\
             # TYPE comm_inbound_accepted_total counter\n\
             comm_inbound_accepted_total {}\n\
             # HELP comm_unauthorized_rejected_total Total inbound sockets rejected as unauthorized\n\
             # TYPE comm_unauthorized_rejected_total counter\n\
             comm_unauthorized_rejected_total {}\n\
             # HELP comm_connect_retries_total Total outbound dial retries\n\
             # TYPE comm_connect_retries_total counter\n\
             comm_connect_retries_total {}\n\
             # HELP comm_uptime_seconds Time since setup start\n\
             # TYPE comm_uptime_seconds gauge\n\
             comm_uptime_seconds {}\n",
            self.channels_ready.load(Ordering::Relaxed),
            self.handshakes_completed_total.load(Ordering::Relaxed),
            self.handshake_failures_total.load(Ordering::Relaxed),
            self.inbound_accepted_total.load(Ordering::Relaxed),
            self.unauthorized_rejected_total.load(Ordering::Relaxed),
            self.connect_retries_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
