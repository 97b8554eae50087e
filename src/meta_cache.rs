//! Expiring metadata cache.
//!
//! Stores opaque byte blobs (security descriptors, directory listings,
//! stream listings, extended attributes) keyed by an opaque 64-bit handle.
//! Entries carry a TTL fixed at cache construction; references pin an entry
//! so that invalidation of a pinned entry defers reclamation to the last
//! releaser. Handle value 0 is reserved and always misses.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

const SHARD_COUNT: u64 = 16;

/// A pinned view of a cached blob. The view stays valid (and the bytes
/// stable) until dropped, even if the entry is invalidated or evicted in
/// the meantime; dropping the view is the release half of the
/// reference/release bracket.
#[derive(Clone, Debug)]
pub struct CachedBuf(Arc<[u8]>);

impl Deref for CachedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for CachedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
struct Entry {
    data: Arc<[u8]>,
    expires: Option<Instant>,
    /// Eviction order stamp; smallest unpinned entry goes first.
    touch: u64,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|deadline| deadline <= now)
    }

    fn pinned(&self) -> bool {
        // the map itself holds one reference; anything above that is a pin
        Arc::strong_count(&self.data) > 1
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<u64, Entry>,
    touch_counter: u64,
}

/// Sharded TTL-plus-LRU blob cache.
#[derive(Debug)]
pub struct MetaCache {
    shards: Box<[Mutex<Shard>]>,
    capacity_per_shard: usize,
    ttl: Option<Duration>,
    handle_counter: Mutex<u64>,
}

impl MetaCache {
    /// Create a cache holding up to `capacity` entries with the given TTL;
    /// `None` disables expiration.
    #[must_use]
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MetaCache {
            shards,
            capacity_per_shard: capacity.div_ceil(SHARD_COUNT as usize).max(1),
            ttl,
            handle_counter: Mutex::new(0),
        }
    }

    fn shard_of(&self, handle: u64) -> &Mutex<Shard> {
        &self.shards[(handle % SHARD_COUNT) as usize]
    }

    /// Copy `buf` into the cache and return its handle. Returns 0 (the
    /// never-matching handle) when the shard is saturated with pinned
    /// entries and nothing can be evicted; callers treat that as "not
    /// cached".
    pub fn add(&self, buf: &[u8]) -> u64 {
        let handle = {
            let mut counter = self.handle_counter.lock();
            *counter += 1;
            *counter
        };

        let now = Instant::now();
        let mut shard = self.shard_of(handle).lock();

        if shard.entries.len() >= self.capacity_per_shard && !evict_one(&mut shard, now) {
            return 0;
        }

        shard.touch_counter += 1;
        let touch = shard.touch_counter;
        shard.entries.insert(
            handle,
            Entry {
                data: Arc::from(buf),
                expires: self.ttl.map(|ttl| now + ttl),
                touch,
            },
        );
        handle
    }

    /// Pin and return the blob named by `handle`, or `None` on a dead,
    /// expired, or reserved handle.
    pub fn reference(&self, handle: u64) -> Option<CachedBuf> {
        if handle == 0 {
            return None;
        }
        let now = Instant::now();
        let mut shard = self.shard_of(handle).lock();
        shard.touch_counter += 1;
        let touch = shard.touch_counter;
        let entry = shard.entries.get_mut(&handle)?;
        if entry.expired(now) {
            return None;
        }
        entry.touch = touch;
        Some(CachedBuf(entry.data.clone()))
    }

    /// Drop the entry named by `handle`. Outstanding pins keep their view;
    /// the handle itself never matches again.
    pub fn invalidate(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        self.shard_of(handle).lock().entries.remove(&handle);
    }

    /// Number of live (possibly expired, not yet reclaimed) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    /// True when no entries are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop one expired or least-recently-touched unpinned entry. Returns false
/// when every entry is pinned.
fn evict_one(shard: &mut Shard, now: Instant) -> bool {
    let expired = shard
        .entries
        .iter()
        .find(|(_, e)| e.expired(now) && !e.pinned())
        .map(|(&h, _)| h);
    if let Some(handle) = expired {
        shard.entries.remove(&handle);
        return true;
    }
    let victim = shard
        .entries
        .iter()
        .filter(|(_, e)| !e.pinned())
        .min_by_key(|(_, e)| e.touch)
        .map(|(&h, _)| h);
    match victim {
        Some(handle) => {
            shard.entries.remove(&handle);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn add_reference_invalidate() {
        let cache = MetaCache::new(64, None);
        let handle = cache.add(b"hello");
        assert_ne!(handle, 0);

        let buf = cache.reference(handle).expect("entry should be live");
        assert_eq!(&*buf, b"hello");

        cache.invalidate(handle);
        assert!(cache.reference(handle).is_none());
        // the outstanding pin still observes a stable view
        assert_eq!(&*buf, b"hello");
    }

    #[test]
    fn zero_handle_never_matches() {
        let cache = MetaCache::new(64, None);
        assert!(cache.reference(0).is_none());
        cache.invalidate(0);
    }

    #[test]
    fn ttl_expiry_counts_as_miss() {
        let cache = MetaCache::new(64, Some(Duration::from_millis(10)));
        let handle = cache.add(b"short-lived");
        assert!(cache.reference(handle).is_some());
        sleep(Duration::from_millis(25));
        assert!(cache.reference(handle).is_none());
    }

    #[test]
    fn infinite_ttl_never_expires() {
        let cache = MetaCache::new(64, None);
        let handle = cache.add(b"forever");
        sleep(Duration::from_millis(5));
        assert!(cache.reference(handle).is_some());
    }

    #[test]
    fn eviction_skips_pinned_entries() {
        // single-entry shards force eviction on every colliding add
        let cache = MetaCache::new(1, None);
        let mut pins = Vec::new();
        let mut handles = Vec::new();
        for i in 0..64u8 {
            let handle = cache.add(&[i]);
            if handle != 0 {
                pins.push(cache.reference(handle).unwrap());
                handles.push(handle);
            }
        }
        // every successful add is pinned, so further adds to a full shard fail
        let mut saturated = 0;
        for _ in 0..64 {
            if cache.add(b"x") == 0 {
                saturated += 1;
            }
        }
        assert!(saturated > 0);
        // pins still read back their original bytes
        for (pin, handle) in pins.iter().zip(&handles) {
            assert_eq!(pin.len(), 1);
            assert!(cache.reference(*handle).is_some());
        }
    }

    #[test]
    fn unpinned_entries_are_evicted_lru_first() {
        let cache = MetaCache::new(1, None);
        // drive two adds into the same shard: handles 16 apart collide
        let first = cache.add(b"first");
        let mut second = 0;
        while second == 0 || second % SHARD_COUNT != first % SHARD_COUNT {
            second = cache.add(b"second");
        }
        // first was the least recently touched; it should be gone
        assert!(cache.reference(first).is_none());
        assert!(cache.reference(second).is_some());
    }
}
