//! Process-wide cache of raw block headers.
//!
//! Header replays for different subscriptions walk the same chain ranges
//! over and over; this cache lets them skip `get_block_headers` round trips
//! for recently fetched heights. Entries are keyed by height (with a hash
//! index on the side), evicted FIFO by insertion once `max_size` is reached,
//! and expire after `max_age` so a chain reorg cannot be served stale
//! indefinitely.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bitcoin::BlockHash;

pub const DEFAULT_MAX_SIZE: usize = 5000;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct CachedHeader {
    raw: Vec<u8>,
    hash: BlockHash,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    by_height: HashMap<u32, CachedHeader>,
    by_hash: HashMap<BlockHash, u32>,
    insertion_order: VecDeque<u32>,
}

/// Shared header cache; all methods take `&self` and may be called from any
/// task.
#[derive(Debug)]
pub struct HeaderCache {
    inner: Mutex<Inner>,
    max_size: usize,
    max_age: Duration,
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_MAX_AGE)
    }
}

impl HeaderCache {
    #[must_use]
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        HeaderCache { inner: Mutex::new(Inner::default()), max_size, max_age }
    }

    pub fn insert(&self, height: u32, hash: BlockHash, raw_header: Vec<u8>) {
        let mut inner = self.lock();

        if let Some(previous) = inner.by_height.insert(
            height,
            CachedHeader { raw: raw_header, hash, inserted_at: Instant::now() },
        ) {
            inner.by_hash.remove(&previous.hash);
        } else {
            inner.insertion_order.push_back(height);
        }
        inner.by_hash.insert(hash, height);

        while inner.insertion_order.len() > self.max_size {
            if let Some(evicted) = inner.insertion_order.pop_front() {
                if let Some(entry) = inner.by_height.remove(&evicted) {
                    inner.by_hash.remove(&entry.hash);
                }
            }
        }
    }

    #[must_use]
    pub fn get_by_height(&self, height: u32) -> Option<Vec<u8>> {
        let inner = self.lock();
        let entry = inner.by_height.get(&height)?;
        if entry.inserted_at.elapsed() > self.max_age {
            return None;
        }
        Some(entry.raw.clone())
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<Vec<u8>> {
        let height = *self.lock().by_hash.get(hash)?;
        self.get_by_height(height)
    }

    /// Returns the raw headers for `count` consecutive heights starting at
    /// `from_height`, or `None` unless every one is cached and fresh.
    #[must_use]
    pub fn get_range(&self, from_height: u32, count: u32) -> Option<Vec<Vec<u8>>> {
        let inner = self.lock();
        let mut headers = Vec::with_capacity(count as usize);
        for height in from_height..from_height.checked_add(count)? {
            let entry = inner.by_height.get(&height)?;
            if entry.inserted_at.elapsed() > self.max_age {
                return None;
            }
            headers.push(entry.raw.clone());
        }
        Some(headers)
    }

    /// Drops every entry.
    pub fn purge(&self) {
        let mut inner = self.lock();
        inner.by_height.clear();
        inner.by_hash.clear();
        inner.insertion_order.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_header;

    fn raw(seed: u8) -> Vec<u8> {
        vec![seed; 80]
    }

    #[test]
    fn lookups_by_height_and_hash() {
        let cache = HeaderCache::new(10, Duration::from_secs(60));
        let hash = make_header(1).block_hash();

        cache.insert(100, hash, raw(1));

        assert_eq!(cache.get_by_height(100), Some(raw(1)));
        assert_eq!(cache.get_by_hash(&hash), Some(raw(1)));
        assert_eq!(cache.get_by_height(101), None);
    }

    #[test]
    fn range_is_all_or_nothing() {
        let cache = HeaderCache::new(10, Duration::from_secs(60));
        for height in [100u32, 101, 103] {
            cache.insert(height, make_header(height as u8).block_hash(), raw(height as u8));
        }

        assert_eq!(cache.get_range(100, 2), Some(vec![raw(100), raw(101)]));
        // Height 102 is missing.
        assert_eq!(cache.get_range(100, 4), None);
    }

    #[test]
    fn evicts_oldest_insertion_first() {
        let cache = HeaderCache::new(2, Duration::from_secs(60));
        for height in [1u32, 2, 3] {
            cache.insert(height, make_header(height as u8).block_hash(), raw(height as u8));
        }

        assert_eq!(cache.get_by_height(1), None);
        assert_eq!(cache.get_by_height(2), Some(raw(2)));
        assert_eq!(cache.get_by_height(3), Some(raw(3)));
    }

    #[test]
    fn entries_expire_after_max_age() {
        let cache = HeaderCache::new(10, Duration::from_millis(1));
        cache.insert(100, make_header(1).block_hash(), raw(1));

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get_by_height(100), None);
    }

    #[test]
    fn purge_clears_everything() {
        let cache = HeaderCache::new(10, Duration::from_secs(60));
        let hash = make_header(1).block_hash();
        cache.insert(100, hash, raw(1));

        cache.purge();

        assert_eq!(cache.get_by_height(100), None);
        assert_eq!(cache.get_by_hash(&hash), None);
    }
}
