use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Failure classes the receiver counts separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    OversizedFrame,
    ConnectionReset,
    Accept,
    Io,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Decode,
        ErrorKind::OversizedFrame,
        ErrorKind::ConnectionReset,
        ErrorKind::Accept,
        ErrorKind::Io,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::OversizedFrame => "oversized_frame",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::Accept => "accept",
            ErrorKind::Io => "io",
        }
    }
}

/// Upper bucket bounds in nanoseconds, last bucket catches everything else.
const BUCKET_BOUNDS_NS: [u64; 8] = [
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    u64::MAX,
];

#[derive(Default)]
pub struct Histogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_ns: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        let idx = BUCKET_BOUNDS_NS
            .iter()
            .position(|bound| ns <= *bound)
            .unwrap_or(BUCKET_BOUNDS_NS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = [0u64; 8];
        for (slot, bucket) in buckets.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        HistogramSnapshot {
            bounds_ns: BUCKET_BOUNDS_NS,
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ns: self.sum_ns.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_ns.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bounds_ns: [u64; 8],
    pub buckets: [u64; 8],
    pub count: u64,
    pub sum_ns: u64,
}

/// Receiver side counters and gauges. Everything is a plain atomic so the
/// hot path never takes a lock; snapshots load each field independently.
#[derive(Default)]
pub struct ReceiverMetrics {
    pub total_received_messages: AtomicU64,
    pub total_clients_connected: AtomicU64,
    pub total_bytes_received: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
    pub active_connections: AtomicU64,
    errors: [AtomicU64; 5],
    pub processing_time: Histogram,
}

impl ReceiverMetrics {
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut errors = BTreeMap::new();
        for kind in ErrorKind::ALL {
            errors.insert(kind.as_str().to_owned(), self.error_count(kind));
        }
        MetricsSnapshot {
            total_received_messages: self.total_received_messages.load(Ordering::Relaxed),
            total_clients_connected: self.total_clients_connected.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_processing_time_ns: self.total_processing_time_ns.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            errors,
            processing_time: self.processing_time.snapshot(),
        }
    }

    /// The only way any counter ever goes backwards.
    pub fn reset(&self) {
        self.total_received_messages.store(0, Ordering::Relaxed);
        self.total_clients_connected.store(0, Ordering::Relaxed);
        self.total_bytes_received.store(0, Ordering::Relaxed);
        self.total_processing_time_ns.store(0, Ordering::Relaxed);
        for counter in &self.errors {
            counter.store(0, Ordering::Relaxed);
        }
        self.processing_time.reset();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_received_messages: u64,
    pub total_clients_connected: u64,
    pub total_bytes_received: u64,
    pub total_processing_time_ns: u64,
    pub active_connections: u64,
    pub errors: BTreeMap<String, u64>,
    pub processing_time: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_duration() {
        let h = Histogram::default();
        h.observe(Duration::from_nanos(500)); // first bucket
        h.observe(Duration::from_micros(50)); // third bucket
        h.observe(Duration::from_secs(5)); // overflow bucket
        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.buckets[0], 1);
        assert_eq!(snap.buckets[2], 1);
        assert_eq!(snap.buckets[7], 1);
    }

    #[test]
    fn reset_zeroes_every_counter() {
        let m = ReceiverMetrics::default();
        m.total_received_messages.fetch_add(3, Ordering::Relaxed);
        m.total_bytes_received.fetch_add(54, Ordering::Relaxed);
        m.record_error(ErrorKind::Decode);
        m.processing_time.observe(Duration::from_micros(10));
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.total_received_messages, 0);
        assert_eq!(snap.total_bytes_received, 0);
        assert_eq!(snap.errors["decode"], 0);
        assert_eq!(snap.processing_time.count, 0);
    }
}
