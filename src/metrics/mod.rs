//! Injectable metrics sink (spec §9 "Global state": the Prometheus
//! collector is process-wide in the original; here it is a trait so tests
//! can substitute a no-op implementation and the admin/Prometheus HTTP
//! surface itself stays out of core scope per spec §1).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub trait MetricSink: Send + Sync {
    fn client_login(&self, run_id: &str) {
        let _ = run_id;
    }
    fn proxy_registered(&self, proxy_type: &str) {
        let _ = proxy_type;
    }
    fn proxy_closed(&self, proxy_type: &str) {
        let _ = proxy_type;
    }
    fn work_conn_opened(&self) {}
    fn work_conn_closed(&self) {}
    fn bytes_transferred(&self, proxy_name: &str, inbound: u64, outbound: u64) {
        let _ = (proxy_name, inbound, outbound);
    }
    fn nathole_attempt(&self, mode: u8, succeeded: bool) {
        let _ = (mode, succeeded);
    }
}

#[derive(Default)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {}

/// Simple in-process counters, useful for tests that want to assert on
/// what happened without standing up a real metrics backend.
#[derive(Default)]
pub struct CountingMetricSink {
    pub logins: AtomicU64,
    pub proxies_registered: AtomicU64,
    pub proxies_closed: AtomicU64,
    pub work_conns_open: AtomicI64,
    pub nathole_successes: AtomicU64,
    pub nathole_failures: AtomicU64,
}

impl MetricSink for CountingMetricSink {
    fn client_login(&self, _run_id: &str) {
        self.logins.fetch_add(1, Ordering::Relaxed);
    }
    fn proxy_registered(&self, _proxy_type: &str) {
        self.proxies_registered.fetch_add(1, Ordering::Relaxed);
    }
    fn proxy_closed(&self, _proxy_type: &str) {
        self.proxies_closed.fetch_add(1, Ordering::Relaxed);
    }
    fn work_conn_opened(&self) {
        self.work_conns_open.fetch_add(1, Ordering::Relaxed);
    }
    fn work_conn_closed(&self) {
        self.work_conns_open.fetch_add(-1, Ordering::Relaxed);
    }
    fn nathole_attempt(&self, _mode: u8, succeeded: bool) {
        if succeeded {
            self.nathole_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nathole_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn counting_sink_tracks_login_and_proxy_events() {
        let sink = CountingMetricSink::default();
        sink.client_login("run-1");
        sink.proxy_registered("tcp");
        sink.proxy_closed("tcp");
        assert_eq!(sink.logins.load(Ordering::Relaxed), 1);
        assert_eq!(sink.proxies_registered.load(Ordering::Relaxed), 1);
        assert_eq!(sink.proxies_closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn noop_sink_never_panics() {
        let sink = NoopMetricSink;
        sink.client_login("x");
        sink.bytes_transferred("t1", 10, 20);
    }
}
