//! The write side: buffered output, end-of-line translation, encoding,
//! and synchronous or background flushing.
//!
//! Bytes written land in the channel's current output buffer after EOL
//! translation (and encoding, for text writes). A buffer becomes
//! flushable when it fills up, when a newline was produced on a
//! line-buffered channel, or unconditionally on an unbuffered one.
//! Flushing drains the queue in order; a would-block from the driver
//! switches the channel into background-flush mode and the drain resumes
//! from the event loop.

use std::io;
use std::rc::Rc;

use log::{debug, warn};

use crate::buffer::{recycle_buffer, ChannelBuffer};
use crate::channel::{BufferMode, Channel, ChannelCore};
use crate::encoding::{encode, TextEncoding};
use crate::translate::translate_output_eol;

/// Moves a non-empty current output buffer onto the flush queue.
pub(crate) fn queue_cur_out(core: &mut ChannelCore) {
    if let Some(buf) = core.cur_out.take() {
        if buf.is_empty() {
            core.cur_out = Some(buf);
        } else {
            core.out_queue.push_back(buf);
            core.flags.buffer_ready = true;
        }
    }
}

/// Appends raw bytes to the output queue, bypassing translation and
/// encoding. Used for the configured output EOF byte at close time.
pub(crate) fn append_raw_output(core: &mut ChannelCore, bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        if core.cur_out.is_none() {
            core.cur_out = Some(ChannelBuffer::with_capacity(core.buffer_size));
        }
        let buf = match core.cur_out.as_mut() {
            Some(b) => b,
            None => unreachable!(),
        };
        let n = rest.len().min(buf.space());
        if n > 0 {
            buf.writable_slice()[..n].copy_from_slice(&rest[..n]);
            buf.commit(n);
            rest = &rest[n..];
        }
        if buf.space() == 0 {
            if let Some(full) = core.cur_out.take() {
                core.out_queue.push_back(full);
            }
        }
    }
    queue_cur_out(core);
    core.flags.buffer_ready = true;
}

/// Applies the buffering policy after a write produced `saw_newline`.
fn finish_write(core: &mut ChannelCore, saw_newline: bool) {
    match core.buffering {
        BufferMode::Full => {}
        BufferMode::Line => {
            if saw_newline {
                queue_cur_out(core);
            }
        }
        BufferMode::None => {
            queue_cur_out(core);
        }
    }
}

impl Channel {
    /// Writes raw bytes through EOL translation, returning the number of
    /// logical bytes accepted (always `src.len()` unless an error occurs).
    ///
    /// Fails with `EACCES` if the channel is not writable and with `EBUSY`
    /// while a background copy owns the channel.
    pub fn write(self: &Rc<Self>, src: &[u8]) -> io::Result<usize> {
        self.check_not_copying()?;
        self.write_internal(src)
    }

    pub(crate) fn write_internal(self: &Rc<Self>, src: &[u8]) -> io::Result<usize> {
        self.begin_write()?;
        let flush_needed;
        {
            let mut core = self.core.borrow_mut();
            let core_ref = &mut *core;
            let mut rest = src;
            let mut saw_newline = false;
            // The loop also runs on empty input while an LF is owed from a
            // CRLF pair split at the previous buffer boundary.
            while !rest.is_empty() || core_ref.out_eol.owe_lf {
                if core_ref.cur_out.is_none() {
                    core_ref.cur_out = Some(ChannelBuffer::with_capacity(core_ref.buffer_size));
                }
                let mode = core_ref.out_translation;
                let buf = match core_ref.cur_out.as_mut() {
                    Some(b) => b,
                    None => unreachable!(),
                };
                let r = translate_output_eol(
                    mode,
                    &mut core_ref.out_eol,
                    rest,
                    buf.writable_slice(),
                );
                buf.commit(r.produced);
                rest = &rest[r.consumed..];
                if r.newline {
                    saw_newline = true;
                }
                if buf.space() == 0 {
                    if let Some(full) = core_ref.cur_out.take() {
                        core_ref.out_queue.push_back(full);
                        core_ref.flags.buffer_ready = true;
                    }
                }
            }
            finish_write(core_ref, saw_newline);
            flush_needed = core_ref.flags.buffer_ready;
        }
        if flush_needed {
            self.flush_channel(false)?;
        }
        self.update_interest();
        Ok(src.len())
    }

    /// Writes text through EOL translation and the channel's encoding.
    ///
    /// Translation runs first, on the internal representation, then the
    /// result is encoded into the output buffers; a staging buffer of the
    /// channel's buffer size plus two bytes of slack sits between the two
    /// stages.
    pub fn write_text(self: &Rc<Self>, text: &str) -> io::Result<usize> {
        self.check_not_copying()?;
        self.write_text_internal(text)
    }

    pub(crate) fn write_text_internal(self: &Rc<Self>, text: &str) -> io::Result<usize> {
        if self.core.borrow().encoding == TextEncoding::Binary {
            return self.write_internal(text.as_bytes());
        }
        self.begin_write()?;
        let flush_needed;
        {
            let mut core = self.core.borrow_mut();
            let core_ref = &mut *core;
            let mut staging = vec![0u8; core_ref.buffer_size + 2];
            let mut rest = text.as_bytes();
            let mut saw_newline = false;
            while !rest.is_empty() || core_ref.out_eol.owe_lf {
                let t = translate_output_eol(
                    core_ref.out_translation,
                    &mut core_ref.out_eol,
                    rest,
                    &mut staging,
                );
                rest = &rest[t.consumed..];
                if t.newline {
                    saw_newline = true;
                }
                let mut pending = &staging[..t.produced];
                while !pending.is_empty() {
                    if core_ref.cur_out.is_none() {
                        core_ref.cur_out =
                            Some(ChannelBuffer::with_capacity(core_ref.buffer_size));
                    }
                    let encoding = core_ref.encoding;
                    let buf = match core_ref.cur_out.as_mut() {
                        Some(b) => b,
                        None => unreachable!(),
                    };
                    let e = encode(
                        encoding,
                        &mut core_ref.encode_state,
                        pending,
                        buf.writable_slice(),
                    );
                    buf.commit(e.produced);
                    pending = &pending[e.consumed..];
                    if buf.space() == 0 {
                        if let Some(full) = core_ref.cur_out.take() {
                            core_ref.out_queue.push_back(full);
                            core_ref.flags.buffer_ready = true;
                        }
                    }
                }
            }
            finish_write(core_ref, saw_newline);
            flush_needed = core_ref.flags.buffer_ready;
        }
        if flush_needed {
            self.flush_channel(false)?;
        }
        self.update_interest();
        Ok(text.len())
    }

    /// Flushes everything buffered on the output side, including the
    /// partially filled current buffer.
    pub fn flush(self: &Rc<Self>) -> io::Result<()> {
        self.check_not_copying()?;
        self.begin_write()?;
        {
            let mut core = self.core.borrow_mut();
            queue_cur_out(&mut core);
        }
        let result = self.flush_channel(false);
        self.update_interest();
        result
    }

    /// Drains the output queue through the driver.
    ///
    /// `EINTR` is retried. A would-block defers the remaining drain to the
    /// event loop by scheduling a background flush; a blocking-mode driver
    /// reporting would-block is a contract violation and panics. Any other
    /// error discards all queued output and is returned directly, or
    /// latched as the channel's unreported error when flushing from the
    /// background.
    pub(crate) fn flush_channel(self: &Rc<Self>, from_background: bool) -> io::Result<()> {
        loop {
            let mut core = self.core.borrow_mut();
            let core_ref = &mut *core;
            if core_ref.flags.dead {
                return Ok(());
            }

            match core_ref.out_queue.front().map(|b| b.is_empty()) {
                None => {
                    core_ref.flags.buffer_ready = false;
                    let was_background = core_ref.flags.bg_flush_scheduled;
                    core_ref.flags.bg_flush_scheduled = false;
                    let finish_close =
                        core_ref.flags.closed && self.refcount_is_zero() && from_background;
                    drop(core);
                    if was_background && from_background {
                        self.update_interest();
                    }
                    if finish_close {
                        let _ = self.teardown();
                    }
                    return Ok(());
                }
                Some(true) => {
                    if let Some(buf) = core_ref.out_queue.pop_front() {
                        recycle_buffer(core_ref, buf, false);
                    }
                    continue;
                }
                Some(false) => {}
            }

            let io_result = {
                let buf = match core_ref.out_queue.front_mut() {
                    Some(b) => b,
                    None => unreachable!(),
                };
                core_ref.driver.output(buf.readable())
            };

            match io_result {
                Ok(n) if n > 0 => {
                    if let Some(buf) = core_ref.out_queue.front_mut() {
                        buf.consume(n);
                    }
                }
                Ok(_) => {
                    // A zero-byte write is the same condition as
                    // would-block: the device accepted nothing.
                    if !core_ref.flags.nonblocking {
                        panic!(
                            "blocking channel driver for {:?} refused output during flush",
                            self.name()
                        );
                    }
                    core_ref.flags.bg_flush_scheduled = true;
                    debug!("channel {:?} deferring flush to background", self.name());
                    drop(core);
                    self.update_interest();
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !core_ref.flags.nonblocking {
                        panic!(
                            "blocking channel driver for {:?} returned would-block during flush",
                            self.name()
                        );
                    }
                    core_ref.flags.bg_flush_scheduled = true;
                    debug!("channel {:?} deferring flush to background", self.name());
                    drop(core);
                    self.update_interest();
                    return Ok(());
                }
                Err(e) => {
                    let dropped = core_ref.output_buffered();
                    warn!(
                        "write error on channel {:?}: {} ({} buffered bytes discarded)",
                        self.name(),
                        e,
                        dropped
                    );
                    core_ref.out_queue.clear();
                    core_ref.cur_out = None;
                    core_ref.flags.buffer_ready = false;
                    core_ref.flags.bg_flush_scheduled = false;
                    if from_background {
                        core_ref.unreported = Some(e);
                        drop(core);
                        self.update_interest();
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }
    }

    fn refcount_is_zero(&self) -> bool {
        !self.is_registered()
    }
}
