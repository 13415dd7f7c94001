//! Censorship detection.
//!
//! A [`Detector`] answers three questions about a direct connection: did the
//! resolver hand us a poisoned address, does an error look like tampering, and
//! is a payload a forged block page. Detectors are selected by country and held
//! in a [`DetectorCell`] so they can be replaced while connections are reading.

mod rules;

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use tokio::net::TcpStream;

/// Immutable set of detection rules for one country.
#[derive(Debug, Clone)]
pub struct Detector {
    country: String,
    poisoned_ips: FxHashSet<IpAddr>,
    fake_prefixes: Vec<Vec<u8>>,
    tampering_kinds: Vec<io::ErrorKind>,
}

impl Detector {
    /// Build the built-in detector for an ISO 3166-1 alpha-2 country code.
    ///
    /// Unknown or empty codes fall back to the default rules, which only
    /// recognise tampering from error kinds.
    pub fn for_country(country: &str) -> Self {
        let rules = rules::for_country(country);

        Self {
            country: country.to_ascii_uppercase(),
            poisoned_ips: rules.poisoned_ips.iter().map(|ip| IpAddr::V4(*ip)).collect(),
            fake_prefixes: rules.fake_prefixes.iter().map(|p| p.to_vec()).collect(),
            tampering_kinds: rules::TAMPERING_KINDS.to_vec(),
        }
    }

    pub fn with_poisoned_ip(mut self, ip: IpAddr) -> Self {
        self.poisoned_ips.insert(ip);
        self
    }

    pub fn with_fake_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.fake_prefixes.push(prefix.into());
        self
    }

    pub fn with_tampering_kind(mut self, kind: io::ErrorKind) -> Self {
        if !self.tampering_kinds.contains(&kind) {
            self.tampering_kinds.push(kind);
        }
        self
    }

    /// Upper-cased country code this detector was built for.
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Check an established connection for a poisoned resolution.
    ///
    /// A connection whose peer address cannot be read is treated as clean.
    pub fn dns_poisoned(&self, stream: &TcpStream) -> bool {
        stream
            .peer_addr()
            .map(|peer| self.is_poisoned_ip(peer.ip()))
            .unwrap_or(false)
    }

    pub fn is_poisoned_ip(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.poisoned_ips.contains(&ip)
    }

    pub fn tampering_suspected(&self, err: &io::Error) -> bool {
        self.tampering_kinds.contains(&err.kind())
    }

    pub fn fake_response(&self, buf: &[u8]) -> bool {
        self.fake_prefixes
            .iter()
            .any(|prefix| buf.starts_with(prefix))
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::for_country("")
    }
}

/// Atomically replaceable holder of the current [`Detector`].
///
/// Loads are lock-free and always return a complete detector; stores replace
/// the whole value.
pub struct DetectorCell {
    current: ArcSwap<Detector>,
}

impl DetectorCell {
    pub fn new(detector: Detector) -> Self {
        Self {
            current: ArcSwap::from_pointee(detector),
        }
    }

    pub fn load(&self) -> Arc<Detector> {
        self.current.load_full()
    }

    pub fn store(&self, detector: Detector) {
        self.current.store(Arc::new(detector));
    }

    /// Install the built-in detector for `country`.
    pub fn set_country(&self, country: &str) {
        self.store(Detector::for_country(country));
    }
}

impl Default for DetectorCell {
    fn default() -> Self {
        Self::new(Detector::default())
    }
}

static GLOBAL: LazyLock<Arc<DetectorCell>> = LazyLock::new(|| Arc::new(DetectorCell::default()));

/// The process-wide detector cell.
pub fn global() -> Arc<DetectorCell> {
    Arc::clone(&GLOBAL)
}

/// Detector currently installed process-wide.
pub fn current() -> Arc<Detector> {
    GLOBAL.load()
}

/// Load country-specific detection rules process-wide.
pub fn set_country(country: &str) {
    GLOBAL.set_country(country);
}
