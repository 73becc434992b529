//! The Cache: lookup/insert/remove/expire over [`CacheEntry`] handles,
//! backed by a [`ContentStore`] (spec §4.5, §4.6, §6).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use weft_base::Result;

use crate::blobref::Blobref;
use crate::cacheentry::CacheEntry;
use crate::contentstore::ContentStore;

/// Cache-wide counters and size statistics, "with sample moments over
/// entry sizes" (spec §4.5, §8). `size_mean`/`size_variance` are computed
/// over the byte length of every currently-valid entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub expirations: u64,
    /// Number of entries the cache currently holds a handle for.
    pub count: u64,
    /// Sum of the byte length of every valid entry.
    pub aggregate_bytes: u64,
    /// Entries that are not [`CacheEntry::is_complete`] (EMPTY, or valid
    /// with a terminal errnum posted against them).
    pub incomplete: u64,
    /// Entries currently dirty.
    pub dirty: u64,
    pub size_mean: f64,
    pub size_variance: f64,
}

/// Holds [`CacheEntry`] handles keyed by blobref, and the [`ContentStore`]
/// they're backed by. The cache itself never fails on an entry's behalf —
/// per spec §7 "Recovery", entry errors fail only their awaiting
/// consumers.
pub struct Cache {
    entries: RefCell<HashMap<Blobref, CacheEntry>>,
    store: Rc<dyn ContentStore>,
    hits: Cell<u64>,
    misses: Cell<u64>,
    inserts: Cell<u64>,
    expirations: Cell<u64>,
    /// Internal logical clock, advanced by [`Cache::tick`] for callers with
    /// no external epoch source of their own.
    clock: Cell<u64>,
}

impl Cache {
    pub fn new(store: Rc<dyn ContentStore>) -> Cache {
        Cache {
            entries: RefCell::new(HashMap::new()),
            store,
            hits: Cell::new(0),
            misses: Cell::new(0),
            inserts: Cell::new(0),
            expirations: Cell::new(0),
            clock: Cell::new(0),
        }
    }

    /// Advances and returns the cache's internal logical clock, for
    /// callers that have no epoch of their own to pass to [`Cache::lookup`].
    pub fn tick(&self) -> u64 {
        let next = self.clock.get() + 1;
        self.clock.set(next);
        next
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.borrow();
        let sizes: Vec<u64> = entries.values().filter_map(|e| e.bytes().map(|b| b.len() as u64)).collect();
        let count = sizes.len() as f64;
        let aggregate_bytes: u64 = sizes.iter().sum();
        let size_mean = if count > 0.0 { aggregate_bytes as f64 / count } else { 0.0 };
        let size_variance = if count > 0.0 {
            sizes.iter().map(|&s| { let d = s as f64 - size_mean; d * d }).sum::<f64>() / count
        } else {
            0.0
        };
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            inserts: self.inserts.get(),
            expirations: self.expirations.get(),
            count: entries.len() as u64,
            aggregate_bytes,
            incomplete: entries.values().filter(|e| !e.is_complete()).count() as u64,
            dirty: entries.values().filter(|e| e.is_dirty()).count() as u64,
            size_mean,
            size_variance,
        }
    }

    /// Returns the entry for `blobref`, creating an EMPTY one (and kicking
    /// off a fetch from the content store) if it is not yet known.
    /// `epoch` is recorded as the entry's last-use moment, consulted by
    /// [`Cache::expire`]'s threshold-based bulk reclaim.
    pub fn lookup(&self, blobref: &Blobref, epoch: u64) -> CacheEntry {
        if let Some(entry) = self.entries.borrow().get(blobref) {
            self.hits.set(self.hits.get() + 1);
            entry.touch(epoch);
            return entry.clone();
        }
        self.misses.set(self.misses.get() + 1);
        let entry = CacheEntry::empty(blobref.clone());
        self.entries.borrow_mut().insert(blobref.clone(), entry.clone());
        if let Ok(bytes) = self.store.get(blobref) {
            let _ = entry.set_valid(bytes, false);
        }
        entry.touch(epoch);
        entry
    }

    /// Inserts already-known-valid bytes directly, without consulting the
    /// content store — used when a caller already holds the bytes (e.g.
    /// the commit engine after a `STORE` step).
    pub fn insert(&self, blobref: Blobref, bytes: Vec<u8>) -> Result<CacheEntry> {
        let entry = {
            let mut entries = self.entries.borrow_mut();
            entries.entry(blobref.clone()).or_insert_with(|| CacheEntry::empty(blobref.clone())).clone()
        };
        entry.set_valid(bytes, false)?;
        self.inserts.set(self.inserts.get() + 1);
        Ok(entry)
    }

    /// Returns `blobref`'s entry if the cache already knows about it,
    /// without creating one or consulting the content store. Used by the
    /// commit engine to detect "noop stores" — content it's about to
    /// write that's already durable.
    pub fn peek(&self, blobref: &Blobref) -> Option<CacheEntry> {
        self.entries.borrow().get(blobref).cloned()
    }

    /// Drops the cache's handle to `blobref`'s entry, provided it is safe
    /// to do so: fails (returns `false`, leaving the entry in place) if
    /// the entry is dirty or has registered waiters. A blobref the cache
    /// doesn't know about is trivially removed. Existing clones held by
    /// commits remain valid regardless; only the cache's own map entry is
    /// affected.
    pub fn remove(&self, blobref: &Blobref) -> bool {
        let blocked = self.entries.borrow().get(blobref).map(|e| e.is_dirty() || e.has_waiters()).unwrap_or(false);
        if blocked {
            return false;
        }
        self.entries.borrow_mut().remove(blobref);
        true
    }

    /// Bulk-expires entries whose last use is at or before `now - threshold`
    /// and which are valid, not dirty, and have no waiters; returns the
    /// number of entries reclaimed. An entry that fails any of those
    /// conditions is left untouched regardless of age.
    pub fn expire(&self, now: u64, threshold: u64) -> usize {
        let candidates: Vec<Blobref> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, entry)| {
                entry.is_valid()
                    && !entry.is_dirty()
                    && !entry.has_waiters()
                    && now.saturating_sub(entry.last_use()) >= threshold
            })
            .map(|(blobref, _)| blobref.clone())
            .collect();

        let mut expired = 0;
        for blobref in candidates {
            if let Some(entry) = self.entries.borrow_mut().remove(&blobref) {
                entry.force_clear();
                expired += 1;
            }
        }
        self.expirations.set(self.expirations.get() + expired as u64);
        expired
    }

    /// Writes `entry`'s bytes through to the content store and clears its
    /// dirty bit, as the commit engine does for each listed
    /// `DIRTY_CACHE_ENTRIES` entry (spec §4.6, scenario 6).
    pub fn flush(&self, entry: &CacheEntry) -> Result<()> {
        let bytes = entry.bytes().expect("flush is only called on valid entries");
        self.store.put(&entry.blobref(), bytes)?;
        entry.clear_dirty()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::contentstore::MemContentStore;

    #[test]
    fn lookup_of_unknown_blobref_creates_empty_entry() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let r = Blobref::of(b"never stored");
        let entry = cache.lookup(&r, cache.tick());
        assert!(!entry.is_valid());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn lookup_hits_an_entry_populated_from_the_store_and_touches_last_use() {
        let store = Rc::new(MemContentStore::new());
        let r = Blobref::of(b"hello");
        store.put(&r, b"hello".to_vec()).unwrap();

        let cache = Cache::new(store);
        let entry = cache.lookup(&r, 1);
        assert!(entry.is_valid());
        assert_eq!(entry.bytes().unwrap(), b"hello");
        assert_eq!(entry.last_use(), 1);

        let entry2 = cache.lookup(&r, 2);
        assert!(entry2.is_valid());
        assert_eq!(entry.last_use(), 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn insert_populates_cache_without_touching_the_store_until_flush() {
        let store = Rc::new(MemContentStore::new());
        let cache = Cache::new(store.clone());
        let r = Blobref::of(b"new content");
        let entry = cache.insert(r.clone(), b"new content".to_vec()).unwrap();
        entry.set_dirty().unwrap();
        assert!(!store.contains(&r));

        cache.flush(&entry).unwrap();
        assert!(store.contains(&r));
        assert!(!entry.is_dirty());
    }

    #[test]
    fn expire_bulk_reclaims_only_stale_valid_quiescent_entries() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let stale = Blobref::of(b"stale");
        let fresh = Blobref::of(b"fresh");
        let dirty = Blobref::of(b"dirty");

        let stale_entry = cache.insert(stale.clone(), b"stale".to_vec()).unwrap();
        stale_entry.touch(0);
        let fresh_entry = cache.insert(fresh.clone(), b"fresh".to_vec()).unwrap();
        fresh_entry.touch(100);
        let dirty_entry = cache.insert(dirty.clone(), b"dirty".to_vec()).unwrap();
        dirty_entry.touch(0);
        dirty_entry.set_dirty().unwrap();

        let expired = cache.expire(100, 50);
        assert_eq!(expired, 1);
        assert!(!stale_entry.is_valid());
        assert!(fresh_entry.is_valid(), "fresh entry is within the threshold");
        assert!(dirty_entry.is_valid(), "dirty entries are never expired");
        assert_eq!(cache.stats().expirations, 1);

        assert!(cache.peek(&fresh).is_some());
        assert!(cache.peek(&dirty).is_some());
        assert!(cache.peek(&stale).is_none());
    }

    #[test]
    fn remove_fails_on_dirty_or_waited_entries_and_succeeds_otherwise() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let r = Blobref::of(b"x");
        let entry = cache.insert(r.clone(), b"x".to_vec()).unwrap();
        entry.set_dirty().unwrap();
        assert!(!cache.remove(&r), "dirty entries cannot be removed");

        entry.clear_dirty().unwrap();
        entry.wait_until_valid(|| {});
        assert!(!cache.remove(&r), "waited entries cannot be removed");
    }

    #[test]
    fn remove_of_unknown_blobref_trivially_succeeds() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let r = Blobref::of(b"never inserted");
        assert!(cache.remove(&r));
    }

    #[test]
    fn stats_report_count_bytes_incomplete_and_dirty() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let complete = cache.insert(Blobref::of(b"ok"), b"ok".to_vec()).unwrap();
        let broken = cache.insert(Blobref::of(b"broken"), b"broken".to_vec()).unwrap();
        broken.set_errnum_on_valid(5);
        complete.set_dirty().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.aggregate_bytes, 2 + 6);
        assert_eq!(stats.incomplete, 1);
        assert_eq!(stats.dirty, 1);
    }
}
