//! Addresses that should skip the direct path.
//!
//! Direct connections only consume the [`Whitelist`] contract. [`MemoryWhitelist`]
//! is an in-process store whose temporary entries expire after a TTL.

use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Store of addresses that must be reached through the detour path.
pub trait Whitelist: Send + Sync {
    /// Record `addr`. Non-temporary entries are a durable "use detour" marker.
    fn add(&self, addr: &str, temporary: bool);

    /// Whether `addr` is currently flagged only temporarily.
    fn is_temporary(&self, addr: &str) -> bool;
}

struct WhitelistEntry {
    temporary: bool,
    added_at: Instant,
}

/// In-memory whitelist.
pub struct MemoryWhitelist {
    entries: RwLock<FxHashMap<String, WhitelistEntry>>,
    temporary_ttl: Duration,
}

impl MemoryWhitelist {
    pub fn new(temporary_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            temporary_ttl,
        }
    }

    pub fn contains(&self, addr: &str) -> bool {
        let now = Instant::now();
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        entries.get(addr).is_some_and(|e| self.is_live(e, now))
    }

    pub fn remove(&self, addr: &str) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        entries.remove(addr).is_some()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|e| e.values().filter(|entry| self.is_live(entry, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, entry: &WhitelistEntry, now: Instant) -> bool {
        !entry.temporary || now.duration_since(entry.added_at) < self.temporary_ttl
    }
}

impl Whitelist for MemoryWhitelist {
    fn add(&self, addr: &str, temporary: bool) {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        let ttl = self.temporary_ttl;
        entries.retain(|_, e| !e.temporary || now.duration_since(e.added_at) < ttl);

        match entries.get_mut(addr) {
            // Never downgrade a durable entry.
            Some(existing) if !existing.temporary => {}
            Some(existing) => {
                existing.temporary = temporary;
                existing.added_at = now;
            }
            None => {
                entries.insert(
                    addr.to_string(),
                    WhitelistEntry {
                        temporary,
                        added_at: now,
                    },
                );
            }
        }
    }

    fn is_temporary(&self, addr: &str) -> bool {
        let now = Instant::now();
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        entries
            .get(addr)
            .is_some_and(|e| e.temporary && self.is_live(e, now))
    }
}

impl Default for MemoryWhitelist {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}
