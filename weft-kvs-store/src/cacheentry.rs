//! Cache entries: EMPTY / VALID / VALID+DIRTY, with wait-valid and
//! wait-not-dirty queues, a last-use epoch, and a terminal errnum (spec
//! §4.5 "Dirty lifecycle", §5 "Shared-resource policy", §7 "Recovery",
//! §8 "Cache immutability").

use std::cell::RefCell;
use std::rc::Rc;

use weft_base::{fatal, invalid, Result};
use weft_sync::WaitQueue;

use crate::blobref::Blobref;

struct Inner {
    blobref: Blobref,
    bytes: Option<Vec<u8>>,
    dirty: bool,
    /// Logical clock value of this entry's most recent `lookup`, consulted
    /// by `Cache::expire`'s threshold-based bulk reclaim.
    last_use: u64,
    /// A terminal error posted by `set_errnum_on_valid`/`set_errnum_on_notdirty`.
    /// Once set, the entry counts as incomplete regardless of `bytes`.
    errnum: Option<i32>,
    wait_valid: WaitQueue<()>,
    wait_not_dirty: WaitQueue<()>,
}

/// A cache entry, shared by reference (spec §9 "Ownership, not garbage
/// collection"): cloning shares the same underlying state, mutation is
/// performed by one logical owner at a time by convention, not locking.
#[derive(Clone)]
pub struct CacheEntry(Rc<RefCell<Inner>>);

impl CacheEntry {
    pub(crate) fn empty(blobref: Blobref) -> CacheEntry {
        CacheEntry(Rc::new(RefCell::new(Inner {
            blobref,
            bytes: None,
            dirty: false,
            last_use: 0,
            errnum: None,
            wait_valid: WaitQueue::new(),
            wait_not_dirty: WaitQueue::new(),
        })))
    }

    pub fn blobref(&self) -> Blobref {
        self.0.borrow().blobref.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.0.borrow().bytes.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.0.borrow().dirty
    }

    /// Valid with no terminal error posted against it — the distinction
    /// `Cache::stats().incomplete` counts against.
    pub fn is_complete(&self) -> bool {
        let inner = self.0.borrow();
        inner.bytes.is_some() && inner.errnum.is_none()
    }

    /// True if either wait queue currently holds a registered record.
    pub fn has_waiters(&self) -> bool {
        let inner = self.0.borrow();
        !inner.wait_valid.is_empty() || !inner.wait_not_dirty.is_empty()
    }

    pub fn errnum(&self) -> Option<i32> {
        self.0.borrow().errnum
    }

    /// The entry's bytes, if valid.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.0.borrow().bytes.clone()
    }

    pub fn last_use(&self) -> u64 {
        self.0.borrow().last_use
    }

    /// Records `epoch` as this entry's most recent use; consulted by
    /// `Cache::expire`.
    pub(crate) fn touch(&self, epoch: u64) {
        self.0.borrow_mut().last_use = epoch;
    }

    /// Transitions EMPTY -> VALID (or re-affirms an already-valid entry
    /// with identical bytes). Verifies `hash(bytes) == blobref`, per the
    /// cache-immutability invariant; a mismatch is FATAL and poisons the
    /// entry rather than silently accepting bad content.
    pub fn set_valid(&self, bytes: Vec<u8>, dirty: bool) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if !inner.blobref.verify(&bytes) {
            return Err(fatal(format!("cache entry content does not hash to {}", inner.blobref)));
        }
        if let Some(existing) = &inner.bytes {
            if existing != &bytes {
                return Err(fatal(format!("cache entry {} bytes changed after becoming valid", inner.blobref)));
            }
        }
        inner.bytes = Some(bytes);
        inner.dirty = dirty;
        drop(inner);
        self.0.borrow().wait_valid.run();
        if !dirty {
            self.0.borrow().wait_not_dirty.run();
        }
        Ok(())
    }

    /// Marks a valid entry dirty. Requires the entry already be valid —
    /// spec §4.5: "`set_dirty(true)` requires valid".
    pub fn set_dirty(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.bytes.is_none() {
            return Err(invalid(format!("cannot mark cache entry {} dirty before it is valid", inner.blobref)));
        }
        inner.dirty = true;
        Ok(())
    }

    /// Clears the dirty bit (the content has been flushed) and releases
    /// any consumers waiting on not-dirty. Requires the entry already be
    /// valid, symmetric with [`CacheEntry::set_dirty`]'s precondition —
    /// this is what lets `wait_not_dirty` waiters ever fire, so clearing
    /// is not itself gated on the wait-not-dirty queue being empty.
    pub fn clear_dirty(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.bytes.is_none() {
            return Err(invalid(format!("cannot clear dirty on cache entry {} before it is valid", inner.blobref)));
        }
        inner.dirty = false;
        drop(inner);
        self.0.borrow().wait_not_dirty.run();
        Ok(())
    }

    /// Resets a valid entry back to EMPTY, per spec §5's "force-clear".
    /// Pending waiters are left registered; they fire again once the entry
    /// becomes valid a second time.
    pub fn force_clear(&self) {
        let mut inner = self.0.borrow_mut();
        inner.bytes = None;
        inner.dirty = false;
    }

    /// Posts `errnum` as this entry's terminal error and delivers it to
    /// every record currently registered on `wait_valid`, without
    /// dequeuing them (spec §7: async errors flow via each wait record's
    /// error callback, carrying an errnum).
    pub fn set_errnum_on_valid(&self, errnum: i32) {
        self.0.borrow_mut().errnum = Some(errnum);
        self.0.borrow().wait_valid.iter(|w| w.post_error(errnum));
    }

    /// Same as [`CacheEntry::set_errnum_on_valid`], but for `wait_not_dirty`.
    pub fn set_errnum_on_notdirty(&self, errnum: i32) {
        self.0.borrow_mut().errnum = Some(errnum);
        self.0.borrow().wait_not_dirty.iter(|w| w.post_error(errnum));
    }

    /// Suspends `action` until the entry is valid, running it immediately
    /// if it already is.
    pub fn wait_until_valid(&self, action: impl FnOnce() + 'static) {
        if self.is_valid() {
            action();
            return;
        }
        let wait = weft_sync::Wait::new((), action);
        self.0.borrow().wait_valid.add(&wait);
    }

    /// Suspends `action` until the entry is valid and not dirty.
    pub fn wait_until_not_dirty(&self, action: impl FnOnce() + 'static) {
        if self.is_valid() && !self.is_dirty() {
            action();
            return;
        }
        let wait = weft_sync::Wait::new((), action);
        self.0.borrow().wait_not_dirty.add(&wait);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn set_valid_verifies_hash_and_releases_waiters() {
        let blobref = Blobref::of(b"hello");
        let entry = CacheEntry::empty(blobref);
        let fired = Rc::new(StdRefCell::new(false));
        let fired2 = fired.clone();
        entry.wait_until_valid(move || *fired2.borrow_mut() = true);
        assert!(!*fired.borrow());

        entry.set_valid(b"hello".to_vec(), false).unwrap();
        assert!(*fired.borrow());
        assert!(entry.is_valid());
        assert!(!entry.is_dirty());
    }

    #[test]
    fn set_valid_rejects_content_that_does_not_hash_to_the_blobref() {
        let blobref = Blobref::of(b"hello");
        let entry = CacheEntry::empty(blobref);
        assert!(entry.set_valid(b"goodbye".to_vec(), false).is_err());
    }

    #[test]
    fn wait_until_not_dirty_waits_past_dirty_valid_state() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        entry.set_valid(b"x".to_vec(), true).unwrap();

        let fired = Rc::new(StdRefCell::new(false));
        let fired2 = fired.clone();
        entry.wait_until_not_dirty(move || *fired2.borrow_mut() = true);
        assert!(!*fired.borrow());

        entry.clear_dirty().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn force_clear_resets_to_empty() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        entry.set_valid(b"x".to_vec(), false).unwrap();
        entry.force_clear();
        assert!(!entry.is_valid());
    }

    #[test]
    fn set_dirty_and_clear_dirty_require_the_entry_be_valid() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        assert!(entry.set_dirty().is_err());
        assert!(entry.clear_dirty().is_err());

        entry.set_valid(b"x".to_vec(), false).unwrap();
        entry.set_dirty().unwrap();
        assert!(entry.is_dirty());
        entry.clear_dirty().unwrap();
        assert!(!entry.is_dirty());
    }

    #[test]
    fn is_complete_is_false_until_valid_and_false_again_after_a_terminal_error() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        assert!(!entry.is_complete());

        entry.set_valid(b"x".to_vec(), false).unwrap();
        assert!(entry.is_complete());

        entry.set_errnum_on_valid(5);
        assert!(!entry.is_complete());
        assert_eq!(entry.errnum(), Some(5));
    }

    #[test]
    fn set_errnum_on_valid_posts_to_registered_waiters_without_dequeuing() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        let got = Rc::new(StdRefCell::new(None));
        let got2 = got.clone();
        let wait = weft_sync::Wait::new((), || {});
        wait.with_error_action(move |e| *got2.borrow_mut() = Some(e));
        entry.0.borrow().wait_valid.add(&wait);

        entry.set_errnum_on_valid(7);
        assert_eq!(*got.borrow(), Some(7));
        assert!(entry.has_waiters(), "post_error does not dequeue the record");
    }

    #[test]
    fn touch_records_last_use_epoch() {
        let blobref = Blobref::of(b"x");
        let entry = CacheEntry::empty(blobref);
        assert_eq!(entry.last_use(), 0);
        entry.touch(42);
        assert_eq!(entry.last_use(), 42);
    }
}
