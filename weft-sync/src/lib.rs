//! The wait queue primitive: usecount-based resumption records shared
//! across one or more queues. See spec §3 "Wait Record" and §4.1.
//!
//! A [`Wait`] bundles a resumption action with a small piece of caller data
//! (`tag`) used by [`WaitQueue::destroy_matching`] to find it again; the
//! spec's "callback+arg, or captured (handler, message, handle) triple"
//! collapses to a single boxed closure plus `tag` here, since a Rust closure
//! already captures whatever environment it needs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// A resumption record. Always held behind an `Rc` so the same record can be
/// enqueued on more than one [`WaitQueue`] at a time.
pub struct Wait<T = ()> {
    usecount: Cell<u32>,
    action: RefCell<Option<Box<dyn FnOnce()>>>,
    error_action: RefCell<Option<Box<dyn FnOnce(i32)>>>,
    errnum: Cell<Option<i32>>,
    pub tag: T,
}

pub type WaitHandle<T = ()> = Rc<Wait<T>>;

impl<T> Wait<T> {
    pub fn new(tag: T, action: impl FnOnce() + 'static) -> WaitHandle<T> {
        Rc::new(Wait {
            usecount: Cell::new(0),
            action: RefCell::new(Some(Box::new(action))),
            error_action: RefCell::new(None),
            errnum: Cell::new(None),
            tag,
        })
    }

    pub fn with_error_action(&self, error_action: impl FnOnce(i32) + 'static) {
        *self.error_action.borrow_mut() = Some(Box::new(error_action));
    }

    pub fn usecount(&self) -> u32 {
        self.usecount.get()
    }

    fn incref(&self) {
        self.usecount.set(self.usecount.get() + 1);
    }

    /// Decrements the usecount; if it reaches zero, takes and runs the
    /// action (clearing it first, so this can never double-fire even if the
    /// record is somehow released twice).
    fn release(&self) {
        let n = self.usecount.get();
        let n = n.saturating_sub(1);
        self.usecount.set(n);
        if n == 0 {
            if let Some(action) = self.action.borrow_mut().take() {
                action();
            }
        }
    }

    /// Clears the stored action without running it, so a concurrent release
    /// from another queue holding this same record becomes a no-op.
    fn clear_action(&self) {
        self.action.borrow_mut().take();
    }

    /// Records `errnum` and invokes the registered error callback, if any.
    pub fn post_error(&self, errnum: i32) {
        self.errnum.set(Some(errnum));
        if let Some(cb) = self.error_action.borrow_mut().take() {
            cb(errnum);
        }
    }

    pub fn errnum(&self) -> Option<i32> {
        self.errnum.get()
    }
}

/// A FIFO of [`Wait`] records awaiting release.
pub struct WaitQueue<T = ()> {
    records: RefCell<VecDeque<WaitHandle<T>>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        WaitQueue {
            records: RefCell::new(VecDeque::new()),
        }
    }
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// Appends `wait`, incrementing its usecount.
    pub fn add(&self, wait: &WaitHandle<T>) {
        wait.incref();
        self.records.borrow_mut().push_back(Rc::clone(wait));
    }

    /// Atomically snapshots the queue and clears it, then releases each
    /// record. Records enqueued by a released action are not visited in this
    /// same call — they landed in the (now-empty) queue after the snapshot
    /// was taken.
    pub fn run(&self) {
        let snapshot: Vec<WaitHandle<T>> = self.records.borrow_mut().drain(..).collect();
        for wait in snapshot {
            wait.release();
        }
    }

    /// Non-destructively visits every record currently enqueued.
    pub fn iter(&self, mut f: impl FnMut(&WaitHandle<T>)) {
        for wait in self.records.borrow().iter() {
            f(wait);
        }
    }

    /// Removes and releases every record whose tag satisfies `predicate`.
    /// Matching records have their action cleared before release, so if the
    /// same record is also enqueued on another queue, that queue's eventual
    /// release is a no-op rather than a second firing.
    pub fn destroy_matching(&self, predicate: impl Fn(&T) -> bool) {
        let matched: Vec<WaitHandle<T>> = {
            let mut records = self.records.borrow_mut();
            let mut matched = Vec::new();
            let mut i = 0;
            while i < records.len() {
                if predicate(&records[i].tag) {
                    matched.push(records.remove(i).expect("index in bounds"));
                } else {
                    i += 1;
                }
            }
            matched
        };
        for wait in matched {
            wait.clear_action();
            wait.release();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn fires_action_when_usecount_reaches_zero() {
        let fired = Rc::new(StdCell::new(false));
        let fired2 = fired.clone();
        let w = Wait::new((), move || fired2.set(true));
        let q = WaitQueue::new();
        q.add(&w);
        assert_eq!(w.usecount(), 1);
        assert!(!fired.get());
        q.run();
        assert!(fired.get());
        assert_eq!(w.usecount(), 0);
    }

    #[test]
    fn shared_record_fires_once_across_two_queues() {
        let count = Rc::new(StdCell::new(0));
        let count2 = count.clone();
        let w = Wait::new((), move || count2.set(count2.get() + 1));
        let q1 = WaitQueue::new();
        let q2 = WaitQueue::new();
        q1.add(&w);
        q2.add(&w);
        assert_eq!(w.usecount(), 2);

        q1.run();
        assert_eq!(count.get(), 0, "still referenced by q2");
        q2.run();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn run_does_not_process_records_added_during_release() {
        let q = Rc::new(WaitQueue::<()>::new());
        let reentrant_added = Rc::new(StdCell::new(false));

        let q2 = q.clone();
        let reentrant_added2 = reentrant_added.clone();
        let w1 = Wait::new((), move || {
            let w2 = Wait::new((), || {});
            q2.add(&w2);
            reentrant_added2.set(true);
        });
        q.add(&w1);
        q.run();
        assert!(reentrant_added.get());
        assert_eq!(q.len(), 1, "record added during release waits for next run");
    }

    #[test]
    fn destroy_matching_removes_and_releases_without_firing_elsewhere() {
        let fired = Rc::new(StdCell::new(false));
        let fired2 = fired.clone();
        let w = Wait::new(7u32, move || fired2.set(true));
        let q1 = WaitQueue::new();
        let q2 = WaitQueue::new();
        q1.add(&w);
        q2.add(&w);

        q1.destroy_matching(|tag| *tag == 7);
        assert!(q1.is_empty());
        assert_eq!(q2.len(), 1, "q2 still holds its own reference");

        // q2's eventual release must not fire the action a second time,
        // because destroy_matching already cleared it.
        q2.run();
        assert!(!fired.get());
    }

    #[test]
    fn destroy_matching_leaves_non_matching_records() {
        let q = WaitQueue::new();
        let a = Wait::new(1u32, || {});
        let b = Wait::new(2u32, || {});
        q.add(&a);
        q.add(&b);
        q.destroy_matching(|tag| *tag == 1);
        assert_eq!(q.len(), 1);
        let mut tags = Vec::new();
        q.iter(|w| tags.push(w.tag));
        assert_eq!(tags, vec![2]);
    }

    #[test]
    fn post_error_invokes_error_action_and_records_errnum() {
        let got = Rc::new(StdCell::new(0));
        let got2 = got.clone();
        let w = Wait::new((), || {});
        w.with_error_action(move |e| got2.set(e));
        w.post_error(42);
        assert_eq!(got.get(), 42);
        assert_eq!(w.errnum(), Some(42));
    }
}
