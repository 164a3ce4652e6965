//! Duplicate suppression for mesh packets
//!
//! A flooding mesh delivers the same packet several times: once directly and
//! again for every neighbour that rebroadcasts it. The radio also echoes our
//! own transmissions back when a neighbour relays them. Without suppression
//! each copy would land in channel history and could trigger the AI twice.
//!
//! Packets are identified by `(sender node, packet id)`. Entries expire after
//! a TTL and the cache is bounded with LRU eviction.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::DedupConfig;

/// Key for deduplication cache entries
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct PacketKey {
    /// Sender node number
    pub from: u32,
    /// Packet identifier assigned by the sender
    pub packet_id: u32,
}

impl PacketKey {
    /// Create a key
    pub fn new(from: u32, packet_id: u32) -> Self {
        Self { from, packet_id }
    }
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{:08x}/{:08x}", self.from, self.packet_id)
    }
}

/// Direction a packet was first seen traveling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    /// Heard from the mesh
    Received,
    /// Transmitted by this bridge
    Sent,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    first_seen: Instant,
    seen_count: u32,
    origin: PacketOrigin,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total packets checked
    pub total_checks: u64,
    /// Packets that were duplicates
    pub duplicates_blocked: u64,
    /// Packets that were new (passed through)
    pub new_packets: u64,
    /// Entries expired by TTL
    pub ttl_expirations: u64,
    /// Entries evicted by LRU
    pub lru_evictions: u64,
}

impl CacheStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_blocked as f64 / self.total_checks as f64
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<PacketKey, CacheEntry>,
    stats: CacheStats,
}

/// LRU-based deduplication cache with TTL expiration
///
/// Clones share the same underlying cache.
#[derive(Debug, Clone)]
pub struct DeduplicationCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create with custom capacity and TTL
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(cap),
                stats: CacheStats::default(),
            })),
            ttl,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::with_capacity_and_ttl(config.cache_size, config.ttl)
    }

    /// Check whether a packet was already seen, recording it if not
    pub fn check(&self, key: PacketKey, origin: PacketOrigin) -> bool {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.total_checks += 1;

        if let Some(entry) = inner.entries.get_mut(&key) {
            if now.duration_since(entry.first_seen) > self.ttl {
                trace!(key = %key, "Cache entry expired, treating as new");
                entry.first_seen = now;
                entry.seen_count = 1;
                entry.origin = origin;
                inner.stats.ttl_expirations += 1;
                inner.stats.new_packets += 1;
                return false;
            }

            entry.seen_count += 1;
            debug!(
                key = %key,
                seen_count = entry.seen_count,
                first_origin = ?entry.origin,
                "Duplicate packet suppressed"
            );
            inner.stats.duplicates_blocked += 1;
            return true;
        }

        let was_full = inner.entries.len() >= inner.entries.cap().get();
        inner.entries.put(
            key,
            CacheEntry {
                first_seen: now,
                seen_count: 1,
                origin,
            },
        );
        if was_full {
            inner.stats.lru_evictions += 1;
        }
        inner.stats.new_packets += 1;
        false
    }

    /// Check an inbound packet
    pub fn is_duplicate(&self, from: u32, packet_id: u32) -> bool {
        self.check(PacketKey::new(from, packet_id), PacketOrigin::Received)
    }

    /// Record a packet we transmitted so its relayed echo is suppressed
    pub fn mark_sent(&self, from: u32, packet_id: u32) {
        let mut inner = self.inner.lock();
        inner.entries.put(
            PacketKey::new(from, packet_id),
            CacheEntry {
                first_seen: Instant::now(),
                seen_count: 1,
                origin: PacketOrigin::Sent,
            },
        );
    }

    /// Drop entries older than the TTL, returning how many were removed
    pub fn expire_old_entries(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<PacketKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.first_seen) > self.ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.stats.ttl_expirations += expired.len() as u64;
        expired.len()
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Get the configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}
