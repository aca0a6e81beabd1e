//! TTL-bounded cache of already-reported connections.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Identity of a connection for dedup purposes. A PID of 0 stands for
/// "owner unknown".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub pid: u32,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone)]
struct SeenEntry {
    first_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SeenEntry {
    fn new(ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            first_seen: now,
            expires_at: now + ChronoDuration::seconds(ttl_secs),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// LRU cache of connections seen within the TTL window. Owned by the network
/// monitor; not shared across tasks.
#[derive(Debug)]
pub struct SeenConnections {
    cache: LruCache<ConnKey, SeenEntry>,
    ttl_secs: i64,
}

impl SeenConnections {
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_capacity(ttl_secs, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl_secs: u64, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            ttl_secs: ttl_secs as i64,
        }
    }

    /// Returns true if this connection is new (or its previous sighting has
    /// expired) and records it. Returns false if it was reported within the
    /// TTL window.
    pub fn check_and_insert(&mut self, key: ConnKey) -> bool {
        if let Some(entry) = self.cache.get_mut(&key) {
            if entry.is_expired() {
                *entry = SeenEntry::new(self.ttl_secs);
                true
            } else {
                false
            }
        } else {
            self.cache.put(key, SeenEntry::new(self.ttl_secs));
            true
        }
    }

    /// When a connection was first recorded, if still cached.
    pub fn first_seen(&self, key: &ConnKey) -> Option<DateTime<Utc>> {
        self.cache.peek(key).map(|e| e.first_seen)
    }

    /// Drop expired entries. Called at the start of each scan cycle.
    pub fn purge_expired(&mut self) {
        let expired: Vec<ConnKey> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn key(pid: u32, remote_port: u16) -> ConnKey {
        ConnKey {
            pid,
            local_addr: "127.0.0.1".to_string(),
            local_port: 50000,
            remote_addr: "8.8.8.8".to_string(),
            remote_port,
        }
    }

    #[test]
    fn test_first_sighting_reports() {
        let mut seen = SeenConnections::new(3600);
        assert!(seen.check_and_insert(key(100, 443)));
        assert!(!seen.check_and_insert(key(100, 443)));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_distinct_tuples_report_independently() {
        let mut seen = SeenConnections::new(3600);
        assert!(seen.check_and_insert(key(100, 443)));
        assert!(seen.check_and_insert(key(100, 444)));
        assert!(seen.check_and_insert(key(200, 443)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_expired_entry_reports_again() {
        let mut seen = SeenConnections::new(1);
        assert!(seen.check_and_insert(key(100, 443)));
        thread::sleep(Duration::from_secs(2));
        assert!(seen.check_and_insert(key(100, 443)));
    }

    #[test]
    fn test_purge_expired() {
        let mut seen = SeenConnections::new(1);
        seen.check_and_insert(key(100, 443));
        thread::sleep(Duration::from_secs(2));
        seen.check_and_insert(key(100, 444));

        assert_eq!(seen.len(), 2);
        seen.purge_expired();
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_lru_bounds_memory() {
        let mut seen = SeenConnections::with_capacity(3600, 2);
        seen.check_and_insert(key(1, 1));
        seen.check_and_insert(key(2, 2));
        seen.check_and_insert(key(3, 3));

        assert_eq!(seen.len(), 2);
        // Oldest entry was evicted, so it reports as new again
        assert!(seen.check_and_insert(key(1, 1)));
    }

    #[test]
    fn test_first_seen_preserved_while_cached() {
        let mut seen = SeenConnections::new(3600);
        let k = key(100, 443);
        seen.check_and_insert(k.clone());
        let first = seen.first_seen(&k).unwrap();
        seen.check_and_insert(k.clone());
        assert_eq!(seen.first_seen(&k).unwrap(), first);
    }
}
