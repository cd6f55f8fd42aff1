//! Process-wide link counters.
//!
//! Plain atomics bumped from the dispatch loop and the flush worker; read
//! with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static DECODE_FAILURES: AtomicU64 = AtomicU64::new(0);
static PACKETS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static PACKETS_DROPPED: AtomicU64 = AtomicU64::new(0);
static ACKS_CORRELATED: AtomicU64 = AtomicU64::new(0);
static CORRELATION_MISSES: AtomicU64 = AtomicU64::new(0);
static FLUSHES: AtomicU64 = AtomicU64::new(0);
static FLUSH_FAILURES: AtomicU64 = AtomicU64::new(0);
static MQTT_UP: AtomicU64 = AtomicU64::new(0);
static MQTT_DOWN: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_COMPLETED: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_failures() {
    DECODE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_dispatched() {
    PACKETS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
/// Packets discarded with no live session, or pushed out of the deferred queue.
pub fn inc_packets_dropped() {
    PACKETS_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_correlated() {
    ACKS_CORRELATED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_correlation_misses() {
    CORRELATION_MISSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_flushes() {
    FLUSHES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_flush_failures() {
    FLUSH_FAILURES.fetch_add(1, Ordering::Relaxed);
}
/// Radio -> broker.
pub fn inc_mqtt_up() {
    MQTT_UP.fetch_add(1, Ordering::Relaxed);
}
/// Broker -> radio.
pub fn inc_mqtt_down() {
    MQTT_DOWN.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handshakes_completed() {
    HANDSHAKES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub packets_dispatched: u64,
    pub packets_dropped: u64,
    pub acks_correlated: u64,
    pub correlation_misses: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub mqtt_up: u64,
    pub mqtt_down: u64,
    pub handshakes_completed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        decode_failures: DECODE_FAILURES.load(Ordering::Relaxed),
        packets_dispatched: PACKETS_DISPATCHED.load(Ordering::Relaxed),
        packets_dropped: PACKETS_DROPPED.load(Ordering::Relaxed),
        acks_correlated: ACKS_CORRELATED.load(Ordering::Relaxed),
        correlation_misses: CORRELATION_MISSES.load(Ordering::Relaxed),
        flushes: FLUSHES.load(Ordering::Relaxed),
        flush_failures: FLUSH_FAILURES.load(Ordering::Relaxed),
        mqtt_up: MQTT_UP.load(Ordering::Relaxed),
        mqtt_down: MQTT_DOWN.load(Ordering::Relaxed),
        handshakes_completed: HANDSHAKES_COMPLETED.load(Ordering::Relaxed),
    }
}
