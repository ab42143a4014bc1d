//! The channel record: configuration, flag state machine, lifecycle.
//!
//! A [`Channel`] is a stable public handle. Everything a transform swap or
//! an I/O operation mutates lives behind a `RefCell` in [`ChannelCore`],
//! so stacking can retarget the binding without moving the handle and a
//! handler callback can safely re-enter channel operations (no borrow is
//! held while user code runs). Handles are shared with `Rc` and are not
//! thread-safe; each thread drives its own channels.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::{Rc, Weak};

use log::debug;

use crate::buffer::{
    ChannelBuffer, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
use crate::context::IoContext;
use crate::copy::CopyState;
use crate::driver::{Direction, Driver, Ready};
use crate::encoding::{DecodeState, EncodeState, TextEncoding};
use crate::events::HandlerRecord;
use crate::translate::{InputEolState, OutputEolState, Translation};

/// Builds an `io::Error` from a POSIX code.
pub(crate) fn posix_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Output buffering policy of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferMode {
    /// Flush only when a buffer fills up.
    Full,
    /// Additionally flush whenever a newline is written.
    Line,
    /// Flush after every write.
    None,
}

impl BufferMode {
    /// Parses an option value (`full`, `line`, `none`).
    pub fn from_name(name: &str) -> Option<BufferMode> {
        match name {
            "full" => Some(BufferMode::Full),
            "line" => Some(BufferMode::Line),
            "none" => Some(BufferMode::None),
            _ => None,
        }
    }

    /// The option-value spelling of this mode.
    pub fn name(self) -> &'static str {
        match self {
            BufferMode::Full => "full",
            BufferMode::Line => "line",
            BufferMode::None => "none",
        }
    }
}

/// Independent state bits of a channel.
///
/// Deliberately not an enum: several of these are true at once (BLOCKED
/// and EOF are orthogonal, for instance).
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct Flags {
    pub readable: bool,
    pub writable: bool,
    pub nonblocking: bool,
    /// The current output buffer must be flushed.
    pub buffer_ready: bool,
    /// A would-block during flush deferred the drain to the event loop.
    pub bg_flush_scheduled: bool,
    pub eof: bool,
    /// EOF forced by the in-stream EOF byte; survives read attempts until
    /// a seek or an encoding change.
    pub sticky_eof: bool,
    /// The last operation on this channel would have blocked.
    pub blocked: bool,
    /// A line read came up short; suppress the buffered-data timer until
    /// new bytes arrive.
    pub need_more_data: bool,
    pub closed: bool,
    /// Driver already torn down; guards against reentrant I/O during
    /// cleanup.
    pub dead: bool,
}

/// The mutable binding of a channel: driver, queues, conversion state.
///
/// Stacking moves an entire `ChannelCore` between records; nothing in
/// here may refer back to the owning [`Channel`].
pub(crate) struct ChannelCore {
    pub driver: Box<dyn Driver>,
    pub flags: Flags,
    pub buffer_size: usize,
    pub buffering: BufferMode,

    pub in_queue: VecDeque<ChannelBuffer>,
    /// One retained empty buffer for the next refill.
    pub spare_in: Option<ChannelBuffer>,
    /// The output buffer currently being filled.
    pub cur_out: Option<ChannelBuffer>,
    pub out_queue: VecDeque<ChannelBuffer>,

    pub in_translation: Translation,
    pub out_translation: Translation,
    pub in_eof_char: Option<u8>,
    pub out_eof_char: Option<u8>,
    pub encoding: TextEncoding,
    pub decode_state: DecodeState,
    pub encode_state: EncodeState,
    pub in_eol: InputEolState,
    pub out_eol: OutputEolState,

    /// Error from a background operation, surfaced by the next foreground
    /// operation.
    pub unreported: Option<io::Error>,
    /// The channel this one is stacked on top of, if any.
    pub supersedes: Option<Rc<Channel>>,
    /// Set while a background copy owns this channel.
    pub copy: Option<Rc<RefCell<CopyState>>>,
}

impl ChannelCore {
    pub(crate) fn new(driver: Box<dyn Driver>, mode: Ready) -> ChannelCore {
        ChannelCore {
            driver,
            flags: Flags {
                readable: mode.is_readable(),
                writable: mode.is_writable(),
                ..Flags::default()
            },
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffering: BufferMode::Full,
            in_queue: VecDeque::new(),
            spare_in: None,
            cur_out: None,
            out_queue: VecDeque::new(),
            in_translation: Translation::Auto,
            out_translation: Translation::platform(),
            in_eof_char: None,
            out_eof_char: None,
            encoding: TextEncoding::Utf8,
            decode_state: DecodeState::default(),
            encode_state: EncodeState::default(),
            in_eol: InputEolState::default(),
            out_eol: OutputEolState::default(),
            unreported: None,
            supersedes: None,
            copy: None,
        }
    }

    pub(crate) fn input_buffered(&self) -> usize {
        self.in_queue.iter().map(|b| b.len()).sum()
    }

    pub(crate) fn output_buffered(&self) -> usize {
        self.out_queue.iter().map(|b| b.len()).sum::<usize>()
            + self.cur_out.as_ref().map_or(0, |b| b.len())
    }
}

/// A buffered, encoding-aware channel over a pluggable transport.
///
/// Created with [`Channel::new`] or through
/// [`IoContext::open`](crate::IoContext::open). All operations take
/// `&self`; interior mutability keeps the handle stable across stacking.
pub struct Channel {
    name: String,
    /// Registration count. The channel may only be closed at zero.
    refcount: Cell<i32>,
    pub(crate) core: RefCell<ChannelCore>,
    pub(crate) handlers: RefCell<Vec<HandlerRecord>>,
    pub(crate) next_handler_id: Cell<u64>,
    close_hooks: RefCell<Vec<Box<dyn FnOnce(&Channel)>>>,
    pub(crate) context: RefCell<Weak<IoContext>>,
    /// True while a zero-delay readiness timer for this channel is queued.
    pub(crate) timer_armed: Cell<bool>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("refcount", &self.refcount.get())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates a standalone channel over `driver`, open for the directions
    /// in `mode`.
    pub fn new(
        name: impl Into<String>,
        driver: Box<dyn Driver>,
        mode: Ready,
    ) -> io::Result<Rc<Channel>> {
        if mode.is_empty() {
            return Err(posix_err(libc::EINVAL));
        }
        Ok(Rc::new(Channel {
            name: name.into(),
            refcount: Cell::new(0),
            core: RefCell::new(ChannelCore::new(driver, mode)),
            handlers: RefCell::new(Vec::new()),
            next_handler_id: Cell::new(1),
            close_hooks: RefCell::new(Vec::new()),
            context: RefCell::new(Weak::new()),
            timer_armed: Cell::new(false),
        }))
    }

    /// Wraps an already-built core in a fresh record. Used by stacking for
    /// the covered half.
    pub(crate) fn from_core(name: String, core: ChannelCore) -> Rc<Channel> {
        Rc::new(Channel {
            name,
            refcount: Cell::new(0),
            core: RefCell::new(core),
            handlers: RefCell::new(Vec::new()),
            next_handler_id: Cell::new(1),
            close_hooks: RefCell::new(Vec::new()),
            context: RefCell::new(Weak::new()),
            timer_armed: Cell::new(false),
        })
    }

    /// The name this channel was created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel is open for reading.
    pub fn is_readable(&self) -> bool {
        self.core.borrow().flags.readable
    }

    /// Whether the channel is open for writing.
    pub fn is_writable(&self) -> bool {
        self.core.borrow().flags.writable
    }

    /// Whether the last read reached end of file.
    pub fn is_eof(&self) -> bool {
        self.core.borrow().flags.eof
    }

    /// Whether the last operation came up short because the transport
    /// would have blocked.
    pub fn is_blocked(&self) -> bool {
        self.core.borrow().flags.blocked
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.borrow().flags.closed
    }

    /// Whether any registration holds this channel.
    pub fn is_registered(&self) -> bool {
        self.refcount.get() > 0
    }

    /// Bytes buffered on the input side, not yet consumed.
    pub fn input_buffered(&self) -> usize {
        self.core.borrow().input_buffered()
    }

    /// Bytes buffered on the output side, not yet flushed.
    pub fn output_buffered(&self) -> usize {
        self.core.borrow().output_buffered()
    }

    pub(crate) fn retain(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }

    pub(crate) fn release(&self) -> i32 {
        let n = self.refcount.get() - 1;
        self.refcount.set(n);
        n
    }

    // ========================================
    // Configuration
    // ========================================

    /// Switches between blocking and non-blocking mode.
    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        let mut core = self.core.borrow_mut();
        core.driver.set_blocking(blocking)?;
        core.flags.nonblocking = !blocking;
        Ok(())
    }

    /// Whether the channel is in non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.core.borrow().flags.nonblocking
    }

    /// Sets the output buffering policy.
    pub fn set_buffering(&self, mode: BufferMode) {
        self.core.borrow_mut().buffering = mode;
    }

    /// The current output buffering policy.
    pub fn buffering(&self) -> BufferMode {
        self.core.borrow().buffering
    }

    /// Sets the capacity used for newly allocated buffers, clamped to a
    /// sane range. Already-filled buffers keep their size.
    pub fn set_buffer_size(&self, size: usize) {
        let size = size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        self.core.borrow_mut().buffer_size = size;
    }

    /// The configured buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.core.borrow().buffer_size
    }

    /// Sets the end-of-line conventions. `None` leaves a direction
    /// unchanged. Changing a direction resets its carry state.
    pub fn set_translation(&self, input: Option<Translation>, output: Option<Translation>) {
        let mut core = self.core.borrow_mut();
        if let Some(t) = input {
            core.in_translation = t;
            core.in_eol = InputEolState::default();
        }
        if let Some(t) = output {
            core.out_translation = t;
            core.out_eol = OutputEolState::default();
        }
    }

    /// The (input, output) end-of-line conventions.
    pub fn translation(&self) -> (Translation, Translation) {
        let core = self.core.borrow();
        (core.in_translation, core.out_translation)
    }

    /// Sets the text encoding. Resets both conversion states to
    /// start-of-stream and clears a latched in-stream EOF.
    pub fn set_encoding(&self, encoding: TextEncoding) {
        let mut core = self.core.borrow_mut();
        core.encoding = encoding;
        core.decode_state = DecodeState::default();
        core.encode_state = EncodeState::default();
        core.flags.sticky_eof = false;
        core.flags.eof = false;
    }

    /// The current text encoding.
    pub fn encoding(&self) -> TextEncoding {
        self.core.borrow().encoding
    }

    /// Sets the distinguished in-stream EOF bytes for input and output.
    pub fn set_eof_char(&self, input: Option<u8>, output: Option<u8>) {
        let mut core = self.core.borrow_mut();
        core.in_eof_char = input;
        core.out_eof_char = output;
    }

    /// The configured (input, output) EOF bytes.
    pub fn eof_char(&self) -> (Option<u8>, Option<u8>) {
        let core = self.core.borrow();
        (core.in_eof_char, core.out_eof_char)
    }

    /// Puts the channel into binary mode: LF translation in both
    /// directions, no encoding, no EOF bytes.
    pub fn set_binary(&self) {
        self.set_translation(Some(Translation::Lf), Some(Translation::Lf));
        self.set_encoding(TextEncoding::Binary);
        self.set_eof_char(None, None);
    }

    /// Sets a generic or driver-specific option by its string name.
    pub fn set_option(&self, name: &str, value: &str) -> io::Result<()> {
        match name {
            "-blocking" => {
                let blocking = parse_bool(value).ok_or_else(|| posix_err(libc::EINVAL))?;
                self.set_blocking(blocking)
            }
            "-buffering" => {
                let mode =
                    BufferMode::from_name(value).ok_or_else(|| posix_err(libc::EINVAL))?;
                self.set_buffering(mode);
                Ok(())
            }
            "-buffersize" => {
                let size: usize = value.parse().map_err(|_| posix_err(libc::EINVAL))?;
                self.set_buffer_size(size);
                Ok(())
            }
            "-encoding" => {
                let enc =
                    TextEncoding::from_name(value).ok_or_else(|| posix_err(libc::EINVAL))?;
                self.set_encoding(enc);
                Ok(())
            }
            "-eofchar" => {
                let mut parts = value.split_whitespace();
                let first = parts.next().and_then(|t| t.bytes().next());
                let second = parts.next().and_then(|t| t.bytes().next());
                match (first, second) {
                    (None, _) => self.set_eof_char(None, None),
                    (Some(c), None) => self.set_eof_char(Some(c), Some(c)),
                    (Some(i), Some(o)) => self.set_eof_char(Some(i), Some(o)),
                }
                Ok(())
            }
            "-translation" => {
                let mut parts = value.split_whitespace();
                let first = parts.next().unwrap_or("");
                let second = parts.next();
                if first == "binary" && second.is_none() {
                    self.set_binary();
                    return Ok(());
                }
                let input =
                    Translation::from_name(first).ok_or_else(|| posix_err(libc::EINVAL))?;
                let output = match second {
                    None => input,
                    Some(s) => {
                        Translation::from_name(s).ok_or_else(|| posix_err(libc::EINVAL))?
                    }
                };
                self.set_translation(Some(input), Some(output));
                Ok(())
            }
            other => self.core.borrow_mut().driver.set_option(other, value),
        }
    }

    /// Reads a generic or driver-specific option by its string name.
    pub fn get_option(&self, name: &str) -> Option<String> {
        match name {
            "-blocking" => Some(if self.is_nonblocking() { "0" } else { "1" }.to_string()),
            "-buffering" => Some(self.buffering().name().to_string()),
            "-buffersize" => Some(self.buffer_size().to_string()),
            "-encoding" => Some(self.encoding().name().to_string()),
            "-eofchar" => {
                let (i, o) = self.eof_char();
                let fmt = |c: Option<u8>| {
                    c.map(|b| (b as char).to_string()).unwrap_or_default()
                };
                Some(format!("{} {}", fmt(i), fmt(o)).trim_end().to_string())
            }
            "-translation" => {
                let (i, o) = self.translation();
                Some(format!("{} {}", i.name(), o.name()))
            }
            other => self.core.borrow().driver.get_option(other),
        }
    }

    // ========================================
    // Operation entry checks
    // ========================================

    /// Validates and prepares a read: direction, busy, latched error, and
    /// the per-operation flag clearing rules.
    pub(crate) fn begin_read(&self) -> io::Result<()> {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        if core.flags.dead || core.flags.closed {
            return Err(posix_err(libc::EBADF));
        }
        if !core.flags.readable {
            return Err(posix_err(libc::EACCES));
        }
        if let Some(err) = core.unreported.take() {
            return Err(err);
        }
        core.flags.blocked = false;
        core.flags.need_more_data = false;
        if !core.flags.sticky_eof {
            core.flags.eof = false;
        }
        Ok(())
    }

    /// Validates and prepares a write.
    pub(crate) fn begin_write(&self) -> io::Result<()> {
        let mut core = self.core.borrow_mut();
        if core.flags.dead || core.flags.closed {
            return Err(posix_err(libc::EBADF));
        }
        if !core.flags.writable {
            return Err(posix_err(libc::EACCES));
        }
        if let Some(err) = core.unreported.take() {
            return Err(err);
        }
        core.flags.blocked = false;
        Ok(())
    }

    /// Rejects the operation while a background copy owns the channel.
    pub(crate) fn check_not_copying(&self) -> io::Result<()> {
        if self.core.borrow().copy.is_some() {
            return Err(posix_err(libc::EBUSY));
        }
        Ok(())
    }

    /// Temporarily forces blocking mode; returns whether it must be
    /// restored with [`restore_nonblocking`](Channel::restore_nonblocking).
    pub(crate) fn force_blocking(&self) -> io::Result<bool> {
        let mut core = self.core.borrow_mut();
        if core.flags.nonblocking {
            core.driver.set_blocking(true)?;
            core.flags.nonblocking = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn restore_nonblocking(&self, was_forced: bool) {
        if was_forced {
            let mut core = self.core.borrow_mut();
            if core.driver.set_blocking(false).is_ok() {
                core.flags.nonblocking = true;
            }
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Registers a hook to run when the channel is closed, before the
    /// driver is released. Hooks run in registration order.
    pub fn on_close(&self, hook: impl FnOnce(&Channel) + 'static) {
        self.close_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Closes the channel: runs close hooks, appends the output EOF byte,
    /// flushes queued output, and tears the driver down. If a background
    /// flush is still pending the teardown completes when it drains.
    ///
    /// # Panics
    ///
    /// Panics if the channel is still registered. Callers must unregister
    /// first; closing a shared channel under another holder is a bug in
    /// the caller, not an environmental condition.
    pub fn close(self: &Rc<Self>) -> io::Result<()> {
        if self.refcount.get() > 0 {
            panic!(
                "close called on channel {:?} with positive refcount",
                self.name
            );
        }

        let hooks: Vec<Box<dyn FnOnce(&Channel)>> =
            self.close_hooks.borrow_mut().drain(..).collect();
        for hook in hooks {
            hook(self);
        }

        {
            let mut core = self.core.borrow_mut();
            if core.flags.closed || core.flags.dead {
                return Ok(());
            }
            core.flags.closed = true;

            if core.flags.writable {
                if let Some(byte) = core.out_eof_char {
                    crate::output::append_raw_output(&mut core, &[byte]);
                }
            }

            // Buffered input is unreadable once closed.
            core.in_queue.clear();
            core.spare_in = None;

            if core.flags.readable
                && core.flags.writable
                && core.driver.supports_half_close()
            {
                let _ = core.driver.half_close(Direction::Input);
            }
        }

        debug!("closing channel {:?}", self.name);
        let flush_result = self.flush_channel(false);

        let deferred = self.core.borrow().flags.bg_flush_scheduled;
        if deferred {
            // Teardown completes from the event loop once output drains.
            return flush_result;
        }
        let teardown_result = self.teardown();
        flush_result.and(teardown_result)
    }

    /// Final teardown: releases the driver and all buffers, detaches from
    /// the context, and closes the whole stacked chain below.
    pub(crate) fn teardown(self: &Rc<Self>) -> io::Result<()> {
        let below;
        let mut result;
        {
            let mut core = self.core.borrow_mut();
            if core.flags.dead {
                return Ok(());
            }
            core.flags.dead = true;
            core.flags.closed = true;
            result = core.driver.close();
            core.in_queue.clear();
            core.out_queue.clear();
            core.cur_out = None;
            core.spare_in = None;
            below = core.supersedes.take();
        }
        self.handlers.borrow_mut().clear();
        if let Some(ctx) = self.context.borrow().upgrade() {
            ctx.forget(self);
        }
        if let Some(covered) = below {
            {
                covered.core.borrow_mut().flags.closed = true;
            }
            let flushed = covered.flush_channel(false);
            let torn = covered.teardown();
            if result.is_ok() {
                result = flushed.and(torn);
            }
        }
        debug!("channel {:?} torn down", self.name);
        result
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if !core.flags.dead {
            let _ = core.driver.close();
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};

    struct SinkDriver {
        wrote: Rc<RefCell<Vec<u8>>>,
    }

    impl Driver for SinkDriver {
        fn kind(&self) -> &'static str {
            "sink"
        }

        fn input(&mut self, _dst: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn output(&mut self, src: &[u8]) -> io::Result<usize> {
            self.wrote.borrow_mut().extend_from_slice(src);
            Ok(src.len())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn set_blocking(&mut self, _blocking: bool) -> io::Result<()> {
            Ok(())
        }

        fn watch(&mut self, _interest: Ready) {}
    }

    fn sink() -> (Box<SinkDriver>, Rc<RefCell<Vec<u8>>>) {
        let wrote = Rc::new(RefCell::new(Vec::new()));
        (
            Box::new(SinkDriver {
                wrote: Rc::clone(&wrote),
            }),
            wrote,
        )
    }

    #[test]
    fn creation_requires_a_direction() {
        let (driver, _) = sink();
        let err = Channel::new("none", driver, Ready::NONE).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn buffer_size_is_clamped() {
        let (driver, _) = sink();
        let chan = Channel::new("c", driver, Ready::WRITABLE).unwrap();
        chan.set_buffer_size(0);
        assert_eq!(chan.buffer_size(), MIN_BUFFER_SIZE);
        chan.set_buffer_size(usize::MAX);
        assert_eq!(chan.buffer_size(), MAX_BUFFER_SIZE);
    }

    #[test]
    fn full_buffering_holds_line_buffering_flushes() {
        let (driver, wrote) = sink();
        let chan = Channel::new("c", driver, Ready::WRITABLE).unwrap();
        chan.write(b"held").unwrap();
        assert!(wrote.borrow().is_empty());

        chan.set_buffering(BufferMode::Line);
        chan.write(b"back\n").unwrap();
        assert_eq!(&*wrote.borrow(), b"heldback\n");
    }

    #[test]
    fn unbuffered_writes_go_straight_through() {
        let (driver, wrote) = sink();
        let chan = Channel::new("c", driver, Ready::WRITABLE).unwrap();
        chan.set_buffering(BufferMode::None);
        chan.write(b"now").unwrap();
        assert_eq!(&*wrote.borrow(), b"now");
    }

    #[test]
    #[should_panic]
    fn close_with_positive_refcount_panics() {
        let (driver, _) = sink();
        let chan = Channel::new("c", driver, Ready::WRITABLE).unwrap();
        chan.retain();
        let _ = chan.close();
    }

    #[test]
    fn close_is_idempotent_and_flushes() {
        let (driver, wrote) = sink();
        let chan = Channel::new("c", driver, Ready::WRITABLE).unwrap();
        chan.write(b"tail").unwrap();
        chan.close().unwrap();
        assert_eq!(&*wrote.borrow(), b"tail");
        chan.close().unwrap();
    }
}
