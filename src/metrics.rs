//! Process-wide counters for the bridge pipeline.
//!
//! Counters are plain relaxed atomics; `snapshot()` is used by the server's
//! periodic stats log and by `BotServer::status_line`.
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_DROPPED: AtomicU64 = AtomicU64::new(0);
static QUERIES_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static QUERIES_REJECTED: AtomicU64 = AtomicU64::new(0);
static SERVICE_ERRORS: AtomicU64 = AtomicU64::new(0);
static REPLIES_SENT: AtomicU64 = AtomicU64::new(0);
static SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMPLETION_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static COMPLETION_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_received() {
    PACKETS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates_dropped() {
    DUPLICATES_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_queries_dispatched() {
    QUERIES_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_queries_rejected() {
    QUERIES_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_service_errors() {
    SERVICE_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_sent() {
    REPLIES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_send_failures() {
    SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_completion_latency(started: std::time::Instant) {
    let ms = started.elapsed().as_millis() as u64;
    COMPLETION_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    COMPLETION_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub duplicates_dropped: u64,
    pub queries_dispatched: u64,
    pub queries_rejected: u64,
    pub service_errors: u64,
    pub replies_sent: u64,
    pub send_failures: u64,
    /// Mean completion latency in ms (0 when nothing has completed yet)
    pub avg_completion_ms: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    let count = COMPLETION_LATENCY_COUNT.load(Ordering::Relaxed);
    let sum = COMPLETION_LATENCY_SUM_MS.load(Ordering::Relaxed);
    MetricsSnapshot {
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        duplicates_dropped: DUPLICATES_DROPPED.load(Ordering::Relaxed),
        queries_dispatched: QUERIES_DISPATCHED.load(Ordering::Relaxed),
        queries_rejected: QUERIES_REJECTED.load(Ordering::Relaxed),
        service_errors: SERVICE_ERRORS.load(Ordering::Relaxed),
        replies_sent: REPLIES_SENT.load(Ordering::Relaxed),
        send_failures: SEND_FAILURES.load(Ordering::Relaxed),
        avg_completion_ms: if count == 0 { 0 } else { sum / count },
    }
}
