//! Fixed-capacity ring buffer with blocking put/get/peek and a two-phase
//! peek/pop read side.
//!
//! One buffer serves one direction of one node. The dispatcher stages
//! outbound bytes with [`peek`](BoundedBuffer::peek) and only commits them
//! with [`pop`](BoundedBuffer::pop) once the secondary station has
//! acknowledged the frame, so a retry re-presents exactly the same bytes.
//!
//! Timeouts are `Option<Duration>`: `None` waits unboundedly,
//! `Some(Duration::ZERO)` is a non-blocking poll.

use std::cmp::min;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use snafu::ensure;

use crate::types::{ClosedSnafu, Error, OutOfRangeSnafu};

#[derive(Debug)]
struct Ring {
    data: Box<[u8]>,
    rd: usize,
    wr: usize,
    size: usize,
    closed: bool,
}

impl Ring {
    fn free(&self) -> usize {
        self.data.len() - self.size
    }

    fn copy_in(&mut self, src: &[u8]) {
        let cap = self.data.len();
        let first = min(cap - self.wr, src.len());
        self.data[self.wr..self.wr + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest != 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }
        self.wr = (self.wr + src.len()) % cap;
        self.size += src.len();
    }

    fn copy_out(&mut self, dst: &mut [u8], advance: bool) -> usize {
        let cap = self.data.len();
        let len = min(self.size, dst.len());
        let first = min(cap - self.rd, len);
        dst[..first].copy_from_slice(&self.data[self.rd..self.rd + first]);
        let rest = len - first;
        if rest != 0 {
            dst[first..len].copy_from_slice(&self.data[..rest]);
        }
        if advance {
            self.advance_read(len);
        }
        len
    }

    fn advance_read(&mut self, len: usize) {
        self.rd = (self.rd + len) % self.data.len();
        self.size -= len;
    }
}

/// Bounded concurrent byte buffer shared between one application side and
/// the dispatcher worker.
#[derive(Debug)]
pub struct BoundedBuffer {
    ring: Mutex<Ring>,
    /// Signalled when data becomes available to readers.
    avail: Condvar,
    /// Signalled when space becomes available to writers.
    space: Condvar,
}

impl BoundedBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> BoundedBuffer {
        assert!(capacity > 0);
        BoundedBuffer {
            ring: Mutex::new(Ring {
                data: vec![0; capacity].into_boxed_slice(),
                rd: 0,
                wr: 0,
                size: 0,
                closed: false,
            }),
            avail: Condvar::new(),
            space: Condvar::new(),
        }
    }

    /// Append `data`, blocking until the whole slice fits or `timeout`
    /// elapses. Returns `false` on timeout.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] if `data` can never fit, [`Error::Closed`] if
    /// the buffer is closed before or while waiting.
    pub fn put(&self, data: &[u8], timeout: Option<Duration>) -> Result<bool, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.lock();
        ensure!(data.len() <= ring.data.len(), OutOfRangeSnafu);
        loop {
            ensure!(!ring.closed, ClosedSnafu);
            if data.len() <= ring.free() {
                ring.copy_in(data);
                self.avail.notify_all();
                return Ok(true);
            }
            ring = match self.wait(ring, &self.space, deadline) {
                Some(guard) => guard,
                None => return Ok(false),
            };
        }
    }

    /// Drain up to `buf.len()` bytes, blocking until at least one byte is
    /// available or `timeout` elapses. Returns the number of bytes copied,
    /// 0 on timeout.
    ///
    /// # Errors
    /// [`Error::Closed`] if the buffer is closed before or while waiting.
    pub fn get(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        self.read(buf, timeout, true)
    }

    /// Same wait and copy semantics as [`get`](Self::get), but the read
    /// cursor does not advance; commit later with [`pop`](Self::pop).
    pub fn peek(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        self.read(buf, timeout, false)
    }

    /// Advance the read cursor by exactly `len` bytes without copying.
    /// Non-blocking.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] if `len` exceeds the occupied count,
    /// [`Error::Closed`] if the buffer is closed.
    pub fn pop(&self, len: usize) -> Result<(), Error> {
        let mut ring = self.lock();
        ensure!(!ring.closed, ClosedSnafu);
        ensure!(len <= ring.size, OutOfRangeSnafu);
        ring.advance_read(len);
        self.space.notify_all();
        Ok(())
    }

    /// Close the buffer: occupancy is cleared and every blocked and future
    /// operation fails with [`Error::Closed`]. Idempotent and terminal.
    pub fn close(&self) {
        let mut ring = self.lock();
        ring.closed = true;
        ring.size = 0;
        ring.rd = 0;
        ring.wr = 0;
        self.avail.notify_all();
        self.space.notify_all();
    }

    /// Number of occupied bytes.
    pub fn len(&self) -> usize {
        self.lock().size
    }

    /// True when no bytes are occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }

    /// Bytes that could be appended without blocking.
    pub fn free_space(&self) -> usize {
        self.lock().free()
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>, advance: bool) -> Result<usize, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.lock();
        loop {
            ensure!(!ring.closed, ClosedSnafu);
            if ring.size != 0 {
                let len = ring.copy_out(buf, advance);
                if advance {
                    self.space.notify_all();
                }
                return Ok(len);
            }
            ring = match self.wait(ring, &self.avail, deadline) {
                Some(guard) => guard,
                None => return Ok(0),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        unpoison(self.ring.lock())
    }

    /// Wait on `cond`, reacquiring the lock. `None` means the deadline
    /// elapsed; spurious wakeups are handled by the caller's re-check.
    fn wait<'g>(
        &self,
        guard: MutexGuard<'g, Ring>,
        cond: &Condvar,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'g, Ring>> {
        match deadline {
            None => Some(unpoison(cond.wait(guard))),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (guard, _) = unpoison(cond.wait_timeout(guard, deadline - now));
                Some(guard)
            }
        }
    }
}

fn unpoison<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}
