use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NO_SAMPLE: u64 = u64::MAX;

/// Per-connection traffic and liveness counters
#[derive(Debug)]
pub struct ConnectionMetrics {
    // Message counters
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_failures: AtomicU64,
    responses_routed: AtomicU64,
    unsolicited_messages: AtomicU64,
    request_timeouts: AtomicU64,

    // Byte counters
    bytes_sent: AtomicU64,
    payload_bytes_received: AtomicU64,

    // Timing
    start_time: Instant,

    // Ping latency tracking
    last_ping_ms: AtomicU64,
    max_ping_ms: AtomicU64,
    avg_ping_ms: RwLock<f64>,
    ping_samples: AtomicU64,
    ping_failures: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            responses_routed: AtomicU64::new(0),
            unsolicited_messages: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            payload_bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
            last_ping_ms: AtomicU64::new(NO_SAMPLE),
            max_ping_ms: AtomicU64::new(0),
            avg_ping_ms: RwLock::new(0.0),
            ping_samples: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
        }
    }

    /// Record a frame written to the socket
    pub fn record_message_sent(&self, frame_bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(frame_bytes as u64, Ordering::Relaxed);
    }

    /// Record a message parsed from the socket
    pub fn record_message_received(&self, payload_bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes_received
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_routed(&self) {
        self.responses_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsolicited(&self) {
        self.unsolicited_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_failure(&self) {
        self.ping_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a ping round trip
    pub fn record_ping(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.last_ping_ms.store(latency_ms, Ordering::Relaxed);
        self.max_ping_ms.fetch_max(latency_ms, Ordering::Relaxed);

        // Exponential moving average; the first sample seeds it
        let mut avg = self.avg_ping_ms.write();
        let samples = self.ping_samples.fetch_add(1, Ordering::Relaxed) + 1;
        if samples == 1 {
            *avg = latency_ms as f64;
        } else {
            let alpha = 0.1;
            *avg = *avg * (1.0 - alpha) + (latency_ms as f64) * alpha;
        }
    }

    /// Most recent ping round trip, if any ping has succeeded yet
    pub fn last_ping(&self) -> Option<Duration> {
        match self.last_ping_ms.load(Ordering::Relaxed) {
            NO_SAMPLE => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            responses_routed: self.responses_routed.load(Ordering::Relaxed),
            unsolicited_messages: self.unsolicited_messages.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            payload_bytes_received: self.payload_bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            last_ping_ms: self.last_ping().map(|d| d.as_millis() as u64),
            max_ping_ms: self.max_ping_ms.load(Ordering::Relaxed),
            avg_ping_ms: *self.avg_ping_ms.read(),
            ping_samples: self.ping_samples.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of connection metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub responses_routed: u64,
    pub unsolicited_messages: u64,
    pub request_timeouts: u64,
    pub bytes_sent: u64,
    pub payload_bytes_received: u64,
    pub uptime_seconds: u64,
    pub last_ping_ms: Option<u64>,
    pub max_ping_ms: u64,
    pub avg_ping_ms: f64,
    pub ping_samples: u64,
    pub ping_failures: u64,
}

impl ConnectionMetricsSnapshot {
    /// Share of attempted sends that reached the socket
    pub fn send_success_rate(&self) -> f64 {
        let total = self.messages_sent + self.send_failures;
        if total == 0 {
            return 1.0;
        }
        self.messages_sent as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_counters() {
        let metrics = ConnectionMetrics::new();

        metrics.record_message_sent(100);
        metrics.record_message_received(200);
        metrics.record_unsolicited();
        metrics.record_send_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.payload_bytes_received, 200);
        assert_eq!(snapshot.unsolicited_messages, 1);
        assert_eq!(snapshot.send_success_rate(), 0.5);
    }

    #[test]
    fn test_ping_latency_tracking() {
        let metrics = ConnectionMetrics::new();
        assert!(metrics.last_ping().is_none());

        metrics.record_ping(Duration::from_millis(10));
        metrics.record_ping(Duration::from_millis(30));
        metrics.record_ping(Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.last_ping_ms, Some(20));
        assert_eq!(snapshot.max_ping_ms, 30);
        assert_eq!(snapshot.ping_samples, 3);
        assert!(snapshot.avg_ping_ms >= 10.0 && snapshot.avg_ping_ms <= 30.0);
        assert_eq!(metrics.last_ping(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ConnectionMetrics::new();
        metrics.record_request_timeout();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["request_timeouts"], 1);
        assert!(json["last_ping_ms"].is_null());
    }
}
