//! Collaborators shared by every direct connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::detect::{self, Detector, DetectorCell};
use crate::stats::Stats;
use crate::whitelist::Whitelist;

/// Timeout for dialing a direct connection.
pub const TIMEOUT_TO_CONNECT: Duration = Duration::from_secs(15);

/// Shared state for direct dials: detector, whitelist, and the channel on
/// which addresses confirmed reachable over the direct path are announced.
pub struct Context {
    detectors: Arc<DetectorCell>,
    whitelist: Arc<dyn Whitelist>,
    direct_addrs: Option<mpsc::Sender<String>>,
    connect_timeout: Duration,
    stats: Stats,
}

impl Context {
    /// Context using the process-wide detector.
    pub fn new(whitelist: Arc<dyn Whitelist>) -> Self {
        Self {
            detectors: detect::global(),
            whitelist,
            direct_addrs: None,
            connect_timeout: TIMEOUT_TO_CONNECT,
            stats: Stats::new(),
        }
    }

    pub fn with_detectors(mut self, detectors: Arc<DetectorCell>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Announce direct-capable addresses on `tx`. Sends never block; an
    /// announcement is dropped when the channel is full or closed.
    pub fn with_direct_addrs(mut self, tx: mpsc::Sender<String>) -> Self {
        self.direct_addrs = Some(tx);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn detector(&self) -> Arc<Detector> {
        self.detectors.load()
    }

    pub fn whitelist(&self) -> &dyn Whitelist {
        self.whitelist.as_ref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Best-effort announcement that `addr` works over the direct path.
    pub(crate) fn notify_direct(&self, addr: &str) -> bool {
        match &self.direct_addrs {
            Some(tx) => tx.try_send(addr.to_string()).is_ok(),
            None => false,
        }
    }
}
