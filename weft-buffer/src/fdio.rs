//! Binds a [`Buffer`] and a file descriptor to a [`Reactor`], per spec
//! §4.3: a reader raises a user callback when data becomes available, a
//! writer raises one when its buffer has drained.

use std::cell::RefCell;
use std::os::fd::{FromRawFd, RawFd};
use std::rc::Rc;

use weft_base::Result;
use weft_reactor::{Interest, Reactor, WatcherId};

use crate::buffer::Buffer;

struct ReaderWatchers {
    io: WatcherId,
    prepare: WatcherId,
    check: WatcherId,
    idle: WatcherId,
}

struct ReaderState {
    fd: RawFd,
    buffer: Buffer,
    line_mode: bool,
    eof_sent: bool,
    watchers: Option<ReaderWatchers>,
}

/// Drives reads from `fd` into a [`Buffer`], invoking a user callback once
/// per reactor iteration when data (or final eof) is ready to be consumed.
///
/// Reader state machine (spec §4.3): on IO-readable, reads into the buffer
/// (marking eof and stopping the IO watcher at end of stream); a prepare
/// watcher decides whether there is data ready for the user (a complete
/// line in line mode, any bytes otherwise, or unreported eof) and starts an
/// idle watcher when so; the check watcher (which always runs after idle)
/// stops the idle watcher and invokes the user callback.
pub struct BufferedFdReader {
    state: Rc<RefCell<ReaderState>>,
}

impl BufferedFdReader {
    pub fn new(fd: RawFd, capacity: usize, line_mode: bool) -> BufferedFdReader {
        BufferedFdReader {
            state: Rc::new(RefCell::new(ReaderState {
                fd,
                buffer: Buffer::new(capacity),
                line_mode,
                eof_sent: false,
                watchers: None,
            })),
        }
    }

    pub fn buffer(&self) -> std::cell::Ref<'_, Buffer> {
        std::cell::Ref::map(self.state.borrow(), |s| &s.buffer)
    }

    fn data_ready(state: &ReaderState) -> bool {
        if state.line_mode {
            state.buffer.has_line() || (state.buffer.is_eof() && !state.eof_sent)
        } else {
            !state.buffer.is_empty() || (state.buffer.is_eof() && !state.eof_sent)
        }
    }

    pub fn start(
        &self,
        reactor: &mut Reactor,
        mut on_ready: impl FnMut(&mut Buffer) + 'static,
    ) -> Result<()> {
        let idle_id = reactor.add_idle(|_r| {});

        let prepare_state = self.state.clone();
        let prepare_id = reactor.add_prepare(move |r| {
            if Self::data_ready(&prepare_state.borrow()) {
                r.start(idle_id);
            }
        });

        let check_state = self.state.clone();
        let check_id = reactor.add_check(move |r| {
            r.stop(idle_id);
            if !Self::data_ready(&check_state.borrow()) {
                return;
            }
            let was_eof_only = {
                let st = check_state.borrow();
                st.buffer.is_empty() && st.buffer.is_eof()
            };
            on_ready(&mut check_state.borrow_mut().buffer);
            if was_eof_only {
                check_state.borrow_mut().eof_sent = true;
            }
        });

        let io_state = self.state.clone();
        let fd = self.state.borrow().fd;
        let io_id = reactor.add_io(fd, Interest::Readable, move |r, _interest| {
            let mut st = io_state.borrow_mut();
            if st.buffer.is_eof() {
                return;
            }
            let space = st.buffer.space();
            if space == 0 {
                return;
            }
            let got = st.buffer.write_from_fd(fd, space);
            if matches!(got, Ok(0)) || got.is_err() {
                st.buffer.mark_eof();
                if let Some(w) = &st.watchers {
                    r.stop(w.io);
                }
            }
        })?;

        self.state.borrow_mut().watchers = Some(ReaderWatchers {
            io: io_id,
            prepare: prepare_id,
            check: check_id,
            idle: idle_id,
        });
        Ok(())
    }

    /// Detaches all watchers but retains the buffer and its contents.
    pub fn stop(&self, reactor: &mut Reactor) {
        if let Some(w) = self.state.borrow_mut().watchers.take() {
            let _ = reactor.remove(w.io);
            let _ = reactor.remove(w.prepare);
            let _ = reactor.remove(w.check);
            let _ = reactor.remove(w.idle);
        }
    }
}

struct WriterState {
    fd: RawFd,
    buffer: Buffer,
    eof_requested: bool,
    done: bool,
    close_errno: Option<i32>,
    io: WatcherId,
    prepare: WatcherId,
}

/// Drives writes from a [`Buffer`] out to `fd`.
///
/// Writer state machine (spec §4.3, §5.6 "single-threaded cooperative"):
/// the IO-write watcher starts (via a prepare watcher, standing in for the
/// spec's LOW_READ-triggered start — see `DESIGN.md`) once the buffer holds
/// data; it drains buffer to fd, and when empty with eof requested, closes
/// `fd`, captures the close result, and invokes the user callback exactly
/// once; otherwise it stops until data reappears.
pub struct BufferedFdWriter {
    state: Rc<RefCell<WriterState>>,
}

impl BufferedFdWriter {
    pub fn new(fd: RawFd, capacity: usize, reactor: &mut Reactor) -> Result<BufferedFdWriter> {
        let io_id = reactor.add_io(fd, Interest::Writable, |_, _| {})?;
        reactor.stop(io_id);
        let prepare_id = reactor.add_prepare(|_| {});
        Ok(BufferedFdWriter {
            state: Rc::new(RefCell::new(WriterState {
                fd,
                buffer: Buffer::new(capacity),
                eof_requested: false,
                done: false,
                close_errno: None,
                io: io_id,
                prepare: prepare_id,
            })),
        })
    }

    pub fn buffer_mut(&self) -> std::cell::RefMut<'_, Buffer> {
        std::cell::RefMut::map(self.state.borrow_mut(), |s| &mut s.buffer)
    }

    pub fn request_eof(&self) {
        self.state.borrow_mut().eof_requested = true;
    }

    pub fn close_errno(&self) -> Option<i32> {
        self.state.borrow().close_errno
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().done
    }

    pub fn start(&self, reactor: &mut Reactor, on_drained: impl FnOnce() + 'static) -> Result<()> {
        let fd = self.state.borrow().fd;
        let (old_io, old_prepare) = {
            let st = self.state.borrow();
            (st.io, st.prepare)
        };
        reactor.remove(old_io)?;
        reactor.remove(old_prepare)?;

        // The io watcher needs to stop itself once the buffer drains; since
        // its own id isn't known until `add_io` returns, it's threaded
        // through a cell populated right after registration.
        let self_id = Rc::new(std::cell::Cell::new(0usize));

        let io_state = self.state.clone();
        let mut on_drained = Some(on_drained);
        let self_id_for_io = self_id.clone();
        let io_id = reactor.add_io(fd, Interest::Writable, move |r, _interest| {
            let mut st = io_state.borrow_mut();
            if !st.buffer.is_empty() && st.buffer.read_to_fd(fd, None).is_err() {
                st.eof_requested = true;
            }
            if st.buffer.is_empty() {
                let my_id = self_id_for_io.get();
                if st.eof_requested && !st.done {
                    close_fd(fd);
                    st.close_errno = None;
                    st.done = true;
                    r.stop(my_id);
                    drop(st);
                    if let Some(cb) = on_drained.take() {
                        cb();
                    }
                } else {
                    r.stop(my_id);
                }
            }
        })?;
        self_id.set(io_id);
        reactor.stop(io_id);

        let prepare_state = self.state.clone();
        let prepare_id = reactor.add_prepare(move |r| {
            let st = prepare_state.borrow();
            if !st.buffer.is_empty() && !r.is_active(io_id) {
                r.start(io_id);
            }
        });

        let mut st = self.state.borrow_mut();
        st.io = io_id;
        st.prepare = prepare_id;
        Ok(())
    }

    pub fn stop(&self, reactor: &mut Reactor) {
        let st = self.state.borrow();
        let _ = reactor.remove(st.io);
        let _ = reactor.remove(st.prepare);
    }
}

/// Closes `fd` without a libc dependency, by letting a borrowed `File`'s
/// `Drop` run the close for us. Without `libc` there is no portable way to
/// recover the close(2) errno from `std::fs::File`'s drop glue, so
/// `close_errno` is always `None` on this path; see `DESIGN.md`.
fn close_fd(fd: RawFd) {
    drop(unsafe { std::fs::File::from_raw_fd(fd) });
}
