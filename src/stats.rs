//! Statistics tracking for direct connections.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters of dial and classification outcomes.
pub struct Stats {
    pub dials: AtomicU64,
    pub connected: AtomicU64,
    pub dial_failures: AtomicU64,
    pub dns_poisoned: AtomicU64,
    pub tampering: AtomicU64,
    pub hijacked: AtomicU64,
    pub confirmed_direct: AtomicU64,
    /// Bytes accepted by read classification, across all connections.
    bytes_read: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            dials: AtomicU64::new(0),
            connected: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            dns_poisoned: AtomicU64::new(0),
            tampering: AtomicU64::new(0),
            hijacked: AtomicU64::new(0),
            confirmed_direct: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn record_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_poisoned(&self) {
        self.dns_poisoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tampering(&self) {
        self.tampering.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hijacked(&self) {
        self.hijacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmed_direct(&self) {
        self.confirmed_direct.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            dials: self.dials.swap(0, Ordering::Relaxed),
            connected: self.connected.swap(0, Ordering::Relaxed),
            dial_failures: self.dial_failures.swap(0, Ordering::Relaxed),
            dns_poisoned: self.dns_poisoned.swap(0, Ordering::Relaxed),
            tampering: self.tampering.swap(0, Ordering::Relaxed),
            hijacked: self.hijacked.swap(0, Ordering::Relaxed),
            confirmed_direct: self.confirmed_direct.swap(0, Ordering::Relaxed),
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dials: u64,
    pub connected: u64,
    pub dial_failures: u64,
    pub dns_poisoned: u64,
    pub tampering: u64,
    pub hijacked: u64,
    pub confirmed_direct: u64,
    pub bytes_read: u64,
}
