//! In-memory transports: a scriptable duplex pipe and a seekable byte
//! store.
//!
//! These are the testing workhorses of the stack: protocol behavior can
//! be driven without any real I/O. The duplex driver pairs with a
//! [`MemoryPeer`] that scripts the far end (feed bytes, close, exert
//! write backpressure, observe the interest mask the channel last asked
//! for). The file driver stores bytes in a shared `Vec` and supports
//! seeking.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::rc::Rc;

use chanio::{Direction, Driver, Ready};

struct PipeBuf {
    data: VecDeque<u8>,
    closed: bool,
    /// Write-side capacity; `None` is unbounded. At capacity the driver
    /// reports would-block, which is how tests exercise background
    /// flushing.
    capacity: Option<usize>,
}

impl PipeBuf {
    fn new() -> Rc<RefCell<PipeBuf>> {
        Rc::new(RefCell::new(PipeBuf {
            data: VecDeque::new(),
            closed: false,
            capacity: None,
        }))
    }
}

/// Channel-side driver of an in-memory duplex pipe.
pub struct MemoryDriver {
    incoming: Rc<RefCell<PipeBuf>>,
    outgoing: Rc<RefCell<PipeBuf>>,
    watch: Rc<Cell<Ready>>,
}

/// Test-side remote end of an in-memory duplex pipe.
pub struct MemoryPeer {
    incoming: Rc<RefCell<PipeBuf>>,
    outgoing: Rc<RefCell<PipeBuf>>,
    watch: Rc<Cell<Ready>>,
}

/// Creates a connected (driver, peer) pair.
///
/// Bytes sent by the peer become readable by the channel; bytes the
/// channel writes are collected for the peer. With no data staged and the
/// pipe not closed, reads report would-block, so a channel in blocking
/// mode must have its data staged (and the peer closed, for EOF) before
/// reading.
pub fn memory_duplex() -> (MemoryDriver, MemoryPeer) {
    let to_peer = PipeBuf::new();
    let to_channel = PipeBuf::new();
    let watch = Rc::new(Cell::new(Ready::NONE));
    (
        MemoryDriver {
            incoming: Rc::clone(&to_channel),
            outgoing: Rc::clone(&to_peer),
            watch: Rc::clone(&watch),
        },
        MemoryPeer {
            incoming: to_peer,
            outgoing: to_channel,
            watch,
        },
    )
}

impl MemoryPeer {
    /// Stages bytes for the channel to read.
    pub fn send(&self, bytes: &[u8]) {
        self.outgoing.borrow_mut().data.extend(bytes.iter().copied());
    }

    /// Marks the channel's read side as exhausted: once the staged bytes
    /// are drained, reads report EOF.
    pub fn close(&self) {
        self.outgoing.borrow_mut().closed = true;
    }

    /// Stops accepting channel output: further writes fail with `EPIPE`.
    pub fn close_read(&self) {
        self.incoming.borrow_mut().closed = true;
    }

    /// Takes everything the channel has written so far.
    pub fn recv_all(&self) -> Vec<u8> {
        self.incoming.borrow_mut().data.drain(..).collect()
    }

    /// Bytes the channel has written and the peer has not yet taken.
    pub fn pending(&self) -> usize {
        self.incoming.borrow().data.len()
    }

    /// Bounds how many unread bytes the channel may have outstanding;
    /// writes beyond it report would-block.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.incoming.borrow_mut().capacity = capacity;
    }

    /// The interest mask the channel most recently passed to `watch`.
    pub fn watched(&self) -> Ready {
        self.watch.get()
    }
}

impl Driver for MemoryDriver {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.incoming.borrow_mut();
        if pipe.data.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = dst.len().min(pipe.data.len());
        for slot in dst[..n].iter_mut() {
            *slot = match pipe.data.pop_front() {
                Some(b) => b,
                None => unreachable!(),
            };
        }
        Ok(n)
    }

    fn output(&mut self, src: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outgoing.borrow_mut();
        if pipe.closed {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        let n = match pipe.capacity {
            Some(cap) => {
                let space = cap.saturating_sub(pipe.data.len());
                if space == 0 {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                src.len().min(space)
            }
            None => src.len(),
        };
        pipe.data.extend(src[..n].iter().copied());
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.incoming.borrow_mut().closed = true;
        self.outgoing.borrow_mut().closed = true;
        Ok(())
    }

    fn half_close(&mut self, side: Direction) -> io::Result<()> {
        match side {
            Direction::Input => self.incoming.borrow_mut().closed = true,
            Direction::Output => self.outgoing.borrow_mut().closed = true,
        }
        Ok(())
    }

    fn supports_half_close(&self) -> bool {
        true
    }

    fn set_blocking(&mut self, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn watch(&mut self, interest: Ready) {
        self.watch.set(interest);
    }
}

/// Seekable in-memory byte-store driver, shaped like a regular file.
pub struct MemoryFileDriver {
    store: Rc<RefCell<Vec<u8>>>,
    pos: u64,
}

impl MemoryFileDriver {
    /// Creates a driver over a fresh store, returning the store handle
    /// for inspection and for opening further drivers over the same
    /// bytes.
    pub fn new() -> (MemoryFileDriver, Rc<RefCell<Vec<u8>>>) {
        let store = Rc::new(RefCell::new(Vec::new()));
        (MemoryFileDriver::with_store(Rc::clone(&store)), store)
    }

    /// Creates a driver positioned at offset zero of an existing store.
    pub fn with_store(store: Rc<RefCell<Vec<u8>>>) -> MemoryFileDriver {
        MemoryFileDriver { store, pos: 0 }
    }
}

impl Driver for MemoryFileDriver {
    fn kind(&self) -> &'static str {
        "memory-file"
    }

    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let store = self.store.borrow();
        let pos = self.pos as usize;
        if pos >= store.len() {
            return Ok(0);
        }
        let n = dst.len().min(store.len() - pos);
        dst[..n].copy_from_slice(&store[pos..pos + n]);
        drop(store);
        self.pos += n as u64;
        Ok(n)
    }

    fn output(&mut self, src: &[u8]) -> io::Result<usize> {
        let mut store = self.store.borrow_mut();
        let pos = self.pos as usize;
        if pos > store.len() {
            store.resize(pos, 0);
        }
        let overlap = (store.len() - pos).min(src.len());
        store[pos..pos + overlap].copy_from_slice(&src[..overlap]);
        store.extend_from_slice(&src[overlap..]);
        drop(store);
        self.pos += src.len() as u64;
        Ok(src.len())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.store.borrow().len() as i64;
        let target = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => len + off,
        };
        if target < 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn set_blocking(&mut self, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn watch(&mut self, _interest: Ready) {}
}
