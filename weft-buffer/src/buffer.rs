//! The bounded, line-aware byte FIFO. See spec §4.2.

use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};

use weft_base::{err, ErrorKind, Result};

#[derive(Clone, Copy)]
enum CallbackKind {
    None,
    LowRead(usize),
    ReadLine,
    HighWrite(usize),
}

/// A bounded FIFO of bytes with line awareness and watermark callbacks.
///
/// Backed by a single fixed-capacity `Vec<u8>` rather than a true circular
/// buffer: `write` compacts the valid region to the front whenever the
/// *physical* tail runs out of room but logical space remains, which keeps
/// `peek`'s returned view contiguous. `peek`/`read` return owned copies
/// rather than borrowed slices tied to `&self` — a deliberate simplification
/// over a literal "borrowed pointer valid until next mutation" contract, to
/// keep callback re-entrancy (a callback invoked mid-`write` may itself call
/// back into the buffer) straightforward and safe.
pub struct Buffer {
    size: usize,
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    readonly: bool,
    eof: bool,
    callback_kind: CallbackKind,
    callback_fn: Option<Box<dyn FnMut(&mut Buffer)>>,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        Buffer {
            size,
            data: vec![0u8; size],
            read_pos: 0,
            write_pos: 0,
            readonly: false,
            eof: false,
            callback_kind: CallbackKind::None,
            callback_fn: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn space(&self) -> usize {
        self.size - self.len()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Permanently makes the buffer reject all further writers.
    pub fn readonly(&mut self) {
        self.readonly = true;
    }

    fn compact_if_needed(&mut self, incoming: usize) {
        if self.write_pos + incoming > self.size {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(err(ErrorKind::ReadOnly, "buffer is read-only"));
        }
        if bytes.len() > self.space() {
            return Err(err(ErrorKind::NoSpace, "write exceeds available space"));
        }
        self.compact_if_needed(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        self.fire_low_read();
        self.fire_read_line();
        Ok(())
    }

    /// Appends `s` followed by `\n` as a single unit: either the whole line
    /// is written, or (on insufficient space) nothing is.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        if self.readonly {
            return Err(err(ErrorKind::ReadOnly, "buffer is read-only"));
        }
        if s.len() + 1 > self.space() {
            return Err(err(ErrorKind::NoSpace, "write_line exceeds available space"));
        }
        let mut line = Vec::with_capacity(s.len() + 1);
        line.extend_from_slice(s.as_bytes());
        line.push(b'\n');
        self.write(&line)
    }

    fn valid_region(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Returns up to `n` bytes without consuming them. `n = None` means "all
    /// available bytes".
    pub fn peek(&self, n: Option<usize>) -> Vec<u8> {
        let avail = self.len();
        let take = n.unwrap_or(avail).min(avail);
        self.valid_region()[..take].to_vec()
    }

    /// Like [`Buffer::peek`] but consumes the returned bytes.
    pub fn read(&mut self, n: Option<usize>) -> Vec<u8> {
        let out = self.peek(n);
        self.read_pos += out.len();
        self.fire_high_write();
        out
    }

    /// Discards up to `n` bytes without returning them.
    pub fn drop(&mut self, n: usize) {
        let n = n.min(self.len());
        self.read_pos += n;
        self.fire_high_write();
    }

    pub fn lines(&self) -> usize {
        memchr::memchr_iter(b'\n', self.valid_region()).count()
    }

    pub fn has_line(&self) -> bool {
        memchr::memchr(b'\n', self.valid_region()).is_some()
    }

    fn first_line_len(&self) -> Option<usize> {
        memchr::memchr(b'\n', self.valid_region()).map(|i| i + 1)
    }

    /// Returns the next complete line (including its trailing `\n`), without
    /// consuming it.
    pub fn peek_line(&self) -> Option<Vec<u8>> {
        let len = self.first_line_len()?;
        Some(self.valid_region()[..len].to_vec())
    }

    pub fn peek_line_trimmed(&self) -> Option<Vec<u8>> {
        self.peek_line().map(|mut l| {
            l.pop();
            l
        })
    }

    /// Consumes and returns the next complete line (including its trailing
    /// `\n`).
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let line = self.peek_line()?;
        self.read_pos += line.len();
        self.fire_high_write();
        Some(line)
    }

    pub fn read_line_trimmed(&mut self) -> Option<Vec<u8>> {
        self.read_line().map(|mut l| {
            l.pop();
            l
        })
    }

    /// Discards through the next newline. Returns `false` if no complete
    /// line was present (nothing discarded).
    pub fn drop_line(&mut self) -> bool {
        match self.first_line_len() {
            Some(len) => {
                self.read_pos += len;
                self.fire_high_write();
                true
            }
            None => false,
        }
    }

    /// Borrows `fd` just long enough to perform one `write(2)`/`read(2)`,
    /// without taking ownership (the `File` must never run its `Drop`).
    fn borrow_fd(fd: RawFd) -> ManuallyDrop<std::fs::File> {
        ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) })
    }

    /// Writes up to `n` bytes to `fd` without consuming them.
    pub fn peek_to_fd(&self, fd: RawFd, n: Option<usize>) -> Result<usize> {
        let bytes = self.peek(n);
        let mut f = Self::borrow_fd(fd);
        Ok(f.write(&bytes)?)
    }

    /// Like [`Buffer::peek_to_fd`] but consumes exactly the bytes written.
    pub fn read_to_fd(&mut self, fd: RawFd, n: Option<usize>) -> Result<usize> {
        let written = self.peek_to_fd(fd, n)?;
        self.drop(written);
        Ok(written)
    }

    /// Reads up to `n` bytes from `fd` and appends them to the buffer. A
    /// zero-byte read marks eof. Bounded by remaining space.
    pub fn write_from_fd(&mut self, fd: RawFd, n: usize) -> Result<usize> {
        if self.readonly {
            return Err(err(ErrorKind::ReadOnly, "buffer is read-only"));
        }
        let want = n.min(self.space());
        let mut tmp = vec![0u8; want];
        let mut f = Self::borrow_fd(fd);
        let got = f.read(&mut tmp)?;
        if got == 0 {
            self.eof = true;
        } else {
            self.write(&tmp[..got])?;
        }
        Ok(got)
    }

    // --- callback registration ---

    fn set_kind(&mut self, kind: CallbackKind, cb: Option<Box<dyn FnMut(&mut Buffer)>>) -> Result<()> {
        let conflicts = !matches!(self.callback_kind, CallbackKind::None)
            && !matches!(
                (&self.callback_kind, &kind),
                (CallbackKind::LowRead(_), CallbackKind::LowRead(_))
                    | (CallbackKind::ReadLine, CallbackKind::ReadLine)
                    | (CallbackKind::HighWrite(_), CallbackKind::HighWrite(_))
            );
        if conflicts {
            return Err(err(
                ErrorKind::Inval,
                "buffer already has a different callback variant registered",
            ));
        }
        self.callback_kind = kind;
        self.callback_fn = cb;
        Ok(())
    }

    pub fn set_low_read_callback(
        &mut self,
        low: usize,
        cb: impl FnMut(&mut Buffer) + 'static,
    ) -> Result<()> {
        self.set_kind(CallbackKind::LowRead(low), Some(Box::new(cb)))
    }

    pub fn set_read_line_callback(&mut self, cb: impl FnMut(&mut Buffer) + 'static) -> Result<()> {
        self.set_kind(CallbackKind::ReadLine, Some(Box::new(cb)))
    }

    pub fn set_high_write_callback(
        &mut self,
        high: usize,
        cb: impl FnMut(&mut Buffer) + 'static,
    ) -> Result<()> {
        self.set_kind(CallbackKind::HighWrite(high), Some(Box::new(cb)))
    }

    pub fn clear_callback(&mut self) {
        self.callback_kind = CallbackKind::None;
        self.callback_fn = None;
    }

    fn fire(&mut self) {
        if let Some(mut cb) = self.callback_fn.take() {
            cb(self);
            if self.callback_fn.is_none() {
                self.callback_fn = Some(cb);
            }
        }
    }

    fn fire_low_read(&mut self) {
        if let CallbackKind::LowRead(low) = self.callback_kind {
            if self.len() > low {
                self.fire();
            }
        }
    }

    fn fire_read_line(&mut self) {
        if matches!(self.callback_kind, CallbackKind::ReadLine) && self.has_line() {
            self.fire();
        }
    }

    fn fire_high_write(&mut self) {
        if let CallbackKind::HighWrite(high) = self.callback_kind {
            if self.len() < high {
                self.fire();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let mut b = Buffer::new(16);
        b.write(b"hello").unwrap();
        assert_eq!(b.len(), 5);
        assert_eq!(b.space(), 11);
        assert_eq!(b.peek(None), b"hello");
        assert_eq!(b.read(Some(3)), b"hel");
        assert_eq!(b.read(None), b"lo");
        assert!(b.is_empty());
    }

    #[test]
    fn write_rejects_oversized_input() {
        let mut b = Buffer::new(4);
        assert!(b.write(b"12345").is_err());
    }

    #[test]
    fn readonly_rejects_writers() {
        let mut b = Buffer::new(8);
        b.readonly();
        let e = b.write(b"x").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn line_operations() {
        let mut b = Buffer::new(32);
        b.write(b"one\ntwo\nthr").unwrap();
        assert_eq!(b.lines(), 2);
        assert!(b.has_line());
        assert_eq!(b.read_line_trimmed().unwrap(), b"one");
        assert_eq!(b.lines(), 1);
        assert_eq!(b.peek_line_trimmed().unwrap(), b"two");
        assert!(b.drop_line());
        assert!(!b.drop_line(), "no further complete line remains");
        assert_eq!(b.peek(None), b"thr");
    }

    #[test]
    fn write_line_is_atomic_on_overflow() {
        let mut b = Buffer::new(4);
        assert!(b.write_line("abcd").is_err()); // needs 5 bytes (4 + \n)
        assert_eq!(b.len(), 0);
        b.write_line("ab").unwrap();
        assert_eq!(b.read_line_trimmed().unwrap(), b"ab");
    }

    #[test]
    fn low_read_and_high_write_watermarks_fire() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut b = Buffer::new(16);
        let low_fired = Rc::new(RefCell::new(0));
        let low_fired2 = low_fired.clone();
        b.set_low_read_callback(2, move |_| *low_fired2.borrow_mut() += 1)
            .unwrap();

        b.write(b"a").unwrap(); // len=1, not > 2
        assert_eq!(*low_fired.borrow(), 0);
        b.write(b"bb").unwrap(); // len=3, > 2
        assert_eq!(*low_fired.borrow(), 1);

        b.clear_callback();
        let high_fired = Rc::new(RefCell::new(0));
        let high_fired2 = high_fired.clone();
        b.set_high_write_callback(2, move |_| *high_fired2.borrow_mut() += 1)
            .unwrap();
        b.read(Some(1)).len(); // len=2, not < 2
        assert_eq!(*high_fired.borrow(), 0);
        b.read(Some(1)).len(); // len=1, < 2
        assert_eq!(*high_fired.borrow(), 1);
    }

    #[test]
    fn conflicting_callback_registration_fails() {
        let mut b = Buffer::new(8);
        b.set_low_read_callback(1, |_| {}).unwrap();
        let e = b.set_read_line_callback(|_| {}).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Inval);
    }

    #[test]
    fn fd_round_trip_via_unix_socket_pair() {
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        let mut out = Buffer::new(32);
        out.write(b"payload").unwrap();
        let written = out.read_to_fd(a.as_raw_fd(), None).unwrap();
        assert_eq!(written, 7);
        assert!(out.is_empty());

        let mut inbuf = Buffer::new(32);
        let got = inbuf.write_from_fd(b.as_raw_fd(), 32).unwrap();
        assert_eq!(got, 7);
        assert_eq!(inbuf.peek(None), b"payload");
    }

    #[test]
    fn compaction_keeps_writes_available_after_wraparound() {
        let mut b = Buffer::new(8);
        b.write(b"1234").unwrap();
        b.drop(4);
        // physically write_pos=4, read_pos=4; a write of 6 bytes needs compaction
        b.write(b"abcdef").unwrap();
        assert_eq!(b.peek(None), b"abcdef");
    }
}
