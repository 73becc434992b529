//! A minimal single-threaded reactor providing the prepare/check/idle/io
//! suspension points used throughout the rest of the workspace. See spec
//! §4.3 and §5 ("one reactor per process drives IO watchers, timers,
//! prepare/check/idle watchers").
//!
//! Each loop iteration runs, in order: pending I/O dispatch, then all active
//! prepare watchers, then all active idle watchers, then all active check
//! watchers. A [`Buffer`](../weft_buffer/struct.Buffer.html)-backed reader
//! uses exactly this ordering: its prepare watcher decides whether data is
//! ready and starts its idle watcher if so; the idle watcher runs (forcing
//! check to fire "this loop tick"); its check watcher stops the idle watcher
//! and invokes the user's callback.

use std::collections::BinaryHeap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use weft_base::{invalid, Result};

pub type WatcherId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
            Interest::Both => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Prepare,
    Check,
    Idle,
    Io,
}

enum Callback {
    Plain(Box<dyn FnMut(&mut Reactor)>),
    Io(Box<dyn FnMut(&mut Reactor, Interest)>),
}

struct Slot {
    kind: Kind,
    active: bool,
    cb: Option<Callback>,
    fd: Option<RawFd>,
}

struct TimerEntry {
    id: WatcherId,
    deadline: Instant,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: BinaryHeap is a max-heap, we want soonest-first.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The reactor. Owns the `mio::Poll` instance and all registered watchers.
pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    timer_cbs: Vec<Option<Box<dyn FnMut(&mut Reactor)>>>,
    timer_free: Vec<usize>,
    timers: BinaryHeap<TimerEntry>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            slots: Vec::new(),
            free: Vec::new(),
            timer_cbs: Vec::new(),
            timer_free: Vec::new(),
            timers: BinaryHeap::new(),
        })
    }

    fn alloc(&mut self, kind: Kind, active: bool, cb: Callback, fd: Option<RawFd>) -> WatcherId {
        let slot = Slot {
            kind,
            active,
            cb: Some(cb),
            fd,
        };
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(slot);
            id
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    pub fn add_prepare(&mut self, cb: impl FnMut(&mut Reactor) + 'static) -> WatcherId {
        self.alloc(Kind::Prepare, true, Callback::Plain(Box::new(cb)), None)
    }

    pub fn add_check(&mut self, cb: impl FnMut(&mut Reactor) + 'static) -> WatcherId {
        self.alloc(Kind::Check, true, Callback::Plain(Box::new(cb)), None)
    }

    /// Idle watchers are created stopped; callers (e.g. a prepare watcher)
    /// `start` them explicitly when there is work to force through this
    /// iteration.
    pub fn add_idle(&mut self, cb: impl FnMut(&mut Reactor) + 'static) -> WatcherId {
        self.alloc(Kind::Idle, false, Callback::Plain(Box::new(cb)), None)
    }

    pub fn add_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        cb: impl FnMut(&mut Reactor, Interest) + 'static,
    ) -> Result<WatcherId> {
        let id = self.alloc(Kind::Io, true, Callback::Io(Box::new(cb)), Some(fd));
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id), interest.to_mio())?;
        tracing::trace!(target: "weft", fd, watcher = id, "io watcher registered");
        Ok(id)
    }

    pub fn add_timer(&mut self, after: Duration, cb: impl FnMut(&mut Reactor) + 'static) -> WatcherId {
        let id = if let Some(id) = self.timer_free.pop() {
            self.timer_cbs[id] = Some(Box::new(cb));
            id
        } else {
            self.timer_cbs.push(Some(Box::new(cb)));
            self.timer_cbs.len() - 1
        };
        self.timers.push(TimerEntry {
            id,
            deadline: Instant::now() + after,
        });
        id
    }

    pub fn start(&mut self, id: WatcherId) {
        if let Some(Some(slot)) = self.slots.get_mut(id) {
            slot.active = true;
        }
    }

    pub fn stop(&mut self, id: WatcherId) {
        if let Some(Some(slot)) = self.slots.get_mut(id) {
            slot.active = false;
        }
    }

    pub fn is_active(&self, id: WatcherId) -> bool {
        matches!(self.slots.get(id), Some(Some(slot)) if slot.active)
    }

    pub fn remove(&mut self, id: WatcherId) -> Result<()> {
        let Some(slot) = self.slots.get_mut(id).and_then(Option::take) else {
            return Ok(());
        };
        if let Some(fd) = slot.fd {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
            tracing::trace!(target: "weft", fd, watcher = id, "io watcher deregistered");
        }
        self.free.push(id);
        Ok(())
    }

    /// True if any watcher (other than idle, which is inert by default) is
    /// still registered; used by [`Reactor::run`] to decide when to stop.
    pub fn has_active_watchers(&self) -> bool {
        self.slots.iter().flatten().any(|s| s.active) || !self.timers.is_empty()
    }

    fn run_kind(&mut self, kind: Kind) {
        let len = self.slots.len();
        for i in 0..len {
            let should_run = matches!(&self.slots[i], Some(slot) if slot.kind == kind && slot.active);
            if !should_run {
                continue;
            }
            let Some(Callback::Plain(mut cb)) = self.slots[i].as_mut().and_then(|s| s.cb.take()) else {
                continue;
            };
            cb(self);
            if let Some(Some(slot)) = self.slots.get_mut(i) {
                slot.cb = Some(Callback::Plain(cb));
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while matches!(self.timers.peek(), Some(t) if t.deadline <= now) {
            let entry = self.timers.pop().expect("peeked Some above");
            let Some(mut cb) = self.timer_cbs.get_mut(entry.id).and_then(Option::take) else {
                continue;
            };
            self.timer_free.push(entry.id);
            cb(self);
        }
    }

    fn dispatch_io(&mut self) -> Result<()> {
        let timeout = self.poll_timeout();
        self.poll.poll(&mut self.events, timeout)?;
        let ready: Vec<(WatcherId, Interest)> = self
            .events
            .iter()
            .map(|ev| {
                let id = ev.token().0;
                let interest = match (ev.is_readable(), ev.is_writable()) {
                    (true, true) => Interest::Both,
                    (true, false) => Interest::Readable,
                    (false, true) => Interest::Writable,
                    (false, false) => Interest::Readable,
                };
                (id, interest)
            })
            .collect();
        for (id, interest) in ready {
            let should_run = matches!(&self.slots.get(id), Some(Some(slot)) if slot.kind == Kind::Io && slot.active);
            if !should_run {
                continue;
            }
            let Some(Callback::Io(mut cb)) = self.slots[id].as_mut().and_then(|s| s.cb.take()) else {
                continue;
            };
            cb(self, interest);
            if let Some(Some(slot)) = self.slots.get_mut(id) {
                slot.cb = Some(Callback::Io(cb));
            }
        }
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.timers.peek().map(|t| {
            t.deadline
                .saturating_duration_since(Instant::now())
        })
    }

    /// Runs a single reactor iteration: io dispatch, prepare, idle, check.
    pub fn run_once(&mut self) -> Result<()> {
        self.dispatch_io()?;
        self.fire_due_timers();
        self.run_kind(Kind::Prepare);
        self.run_kind(Kind::Idle);
        self.run_kind(Kind::Check);
        Ok(())
    }

    /// Runs iterations until no watcher remains active.
    pub fn run(&mut self) -> Result<()> {
        while self.has_active_watchers() {
            self.run_once()?;
        }
        Ok(())
    }
}

/// Validates a requested change before applying it; kept here (rather than
/// inlined at call sites) since more than one caller needs the same guard.
pub fn require_valid_watcher(reactor: &Reactor, id: WatcherId) -> Result<()> {
    if reactor.slots.get(id).map(Option::is_some).unwrap_or(false) {
        Ok(())
    } else {
        Err(invalid(format!("no such watcher id {id}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn prepare_idle_check_ordering() {
        let mut r = Reactor::new().unwrap();
        let order = Rc::new(std::cell::RefCell::new(Vec::<&'static str>::new()));

        let idle_id = {
            let order = order.clone();
            r.add_idle(move |_r| order.borrow_mut().push("idle"))
        };

        {
            let order = order.clone();
            r.add_prepare(move |r| {
                order.borrow_mut().push("prepare");
                r.start(idle_id);
            });
        }
        {
            let order = order.clone();
            r.add_check(move |r| {
                order.borrow_mut().push("check");
                r.stop(idle_id);
            });
        }

        r.run_once().unwrap();
        assert_eq!(*order.borrow(), vec!["prepare", "idle", "check"]);

        // idle was stopped by check; next tick it shouldn't fire again.
        order.borrow_mut().clear();
        r.run_once().unwrap();
        assert_eq!(*order.borrow(), vec!["prepare", "check"]);
    }

    #[test]
    fn stopped_watcher_does_not_run() {
        let mut r = Reactor::new().unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let id = r.add_check(move |_| ran2.set(true));
        r.stop(id);
        r.run_once().unwrap();
        assert!(!ran.get());
    }

    #[test]
    fn removed_watcher_is_not_reinvoked() {
        let mut r = Reactor::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let id = r.add_check(move |_| count2.set(count2.get() + 1));
        r.run_once().unwrap();
        r.remove(id).unwrap();
        r.run_once().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn timer_fires_once_after_deadline() {
        let mut r = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        r.add_timer(Duration::from_millis(1), move |_| {
            fired2.set(fired2.get() + 1)
        });
        std::thread::sleep(Duration::from_millis(5));
        r.run_once().unwrap();
        assert_eq!(fired.get(), 1);
        r.run_once().unwrap();
        assert_eq!(fired.get(), 1);
    }
}
