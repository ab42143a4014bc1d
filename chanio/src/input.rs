//! The read side: buffered input, decoding, EOL translation, and the
//! all-or-nothing line read.
//!
//! Raw bytes from the driver queue up in channel buffers. A byte read
//! applies the in-stream EOF byte and EOL translation directly; a text
//! read first decodes to the internal representation, then translates.
//! When a decode stops at an incomplete multi-byte sequence, the
//! undecoded tail is physically copied into the front padding of the next
//! buffer and decoding resumes there once more raw bytes exist.
//!
//! The line read is transactional: if no terminator is found and no more
//! input can be obtained without blocking, every buffer cursor and every
//! carry state is restored to its pre-call value, so a partial line is
//! never consumed.

use std::io;
use std::rc::Rc;

use bytes::BytesMut;

use crate::buffer::{recycle_buffer, ChannelBuffer, BUFFER_PADDING};
use crate::channel::{Channel, ChannelCore};
use crate::encoding::{decode, DecodeState, TextEncoding};
use crate::translate::{
    flush_input_eol, scan_eof_char, translate_input_eol, InputEolState,
};

/// Counts characters in a valid UTF-8 byte span.
fn count_chars(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| (b & 0xC0) != 0x80).count()
}

/// Text reads on a binary channel treat each byte as one character.
fn text_encoding_of(core: &ChannelCore) -> TextEncoding {
    match core.encoding {
        TextEncoding::Binary => TextEncoding::Latin1,
        other => other,
    }
}

fn push_utf8(out: &mut String, bytes: &[u8]) {
    out.push_str(&String::from_utf8_lossy(bytes));
}

/// Saved input-side state for the line-read rollback.
struct InputSnapshot {
    cursors: Vec<usize>,
    in_eol: InputEolState,
    decode_state: DecodeState,
    eof: bool,
    sticky_eof: bool,
    blocked: bool,
}

fn snapshot_input(core: &ChannelCore) -> InputSnapshot {
    InputSnapshot {
        cursors: core.in_queue.iter().map(|b| b.removed_offset()).collect(),
        in_eol: core.in_eol,
        decode_state: core.decode_state,
        eof: core.flags.eof,
        sticky_eof: core.flags.sticky_eof,
        blocked: core.flags.blocked,
    }
}

/// Restores every cursor and carry to its snapshot value. Buffers popped
/// during the attempt are spliced back in front; buffers that arrived
/// after the snapshot keep their (new) contents with their cursor at the
/// initial offset.
fn rollback_input(
    core: &mut ChannelCore,
    snap: &InputSnapshot,
    stash: Vec<(ChannelBuffer, usize)>,
) {
    for (i, buf) in core.in_queue.iter_mut().enumerate() {
        let snap_idx = stash.len() + i;
        let cursor = snap
            .cursors
            .get(snap_idx)
            .copied()
            .unwrap_or(BUFFER_PADDING);
        buf.set_removed(cursor);
    }
    for (mut buf, cursor) in stash.into_iter().rev() {
        buf.set_removed(cursor);
        core.in_queue.push_front(buf);
    }
    core.in_eol = snap.in_eol;
    core.decode_state = snap.decode_state;
    core.flags.eof = snap.eof;
    core.flags.sticky_eof = snap.sticky_eof;
    core.flags.blocked = snap.blocked;
}

/// Pops the head buffer, recording the cursor a rollback must restore.
fn pop_head_to_stash(
    core: &mut ChannelCore,
    stash: &mut Vec<(ChannelBuffer, usize)>,
    snap: &InputSnapshot,
) {
    if let Some(buf) = core.in_queue.pop_front() {
        let cursor = snap
            .cursors
            .get(stash.len())
            .copied()
            .unwrap_or(BUFFER_PADDING);
        stash.push((buf, cursor));
    }
}

/// After an AUTO-mode terminator ended in `\r`, consumes the `\n` half of
/// a CRLF pair if it is already buffered. Otherwise the carry flag stays
/// set and the next translation call swallows it.
fn try_consume_following_lf(core: &mut ChannelCore) {
    if !core.in_eol.cr_seen {
        return;
    }
    for buf in core.in_queue.iter_mut() {
        if buf.is_empty() {
            continue;
        }
        if buf.readable()[0] == b'\n' {
            buf.consume(1);
        }
        core.in_eol.cr_seen = false;
        return;
    }
}

impl Channel {
    /// Pulls one more buffer's worth of raw bytes from the driver.
    ///
    /// Returns the byte count; zero means EOF or would-block was reported,
    /// observable through the channel flags. A short read marks the
    /// channel BLOCKED. A would-block from a blocking-mode driver is a
    /// driver bug and panics.
    pub(crate) fn fill_input(self: &Rc<Self>) -> io::Result<usize> {
        let mut core = self.core.borrow_mut();
        let core_ref = &mut *core;

        let need_new = core_ref.in_queue.back().map_or(true, |b| b.space() == 0);
        if need_new {
            let buf = match core_ref.spare_in.take() {
                Some(mut b) => {
                    b.reset();
                    b
                }
                None => ChannelBuffer::with_capacity(core_ref.buffer_size),
            };
            core_ref.in_queue.push_back(buf);
        }
        let buf = match core_ref.in_queue.back_mut() {
            Some(b) => b,
            None => unreachable!(),
        };
        let want = buf.space();
        loop {
            match core_ref.driver.input(buf.writable_slice()) {
                Ok(0) => {
                    core_ref.flags.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    buf.commit(n);
                    if n < want {
                        core_ref.flags.blocked = true;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !core_ref.flags.nonblocking {
                        panic!(
                            "blocking channel driver for {:?} returned would-block during read",
                            self.name()
                        );
                    }
                    core_ref.flags.blocked = true;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads up to `max` bytes through EOL translation (no decoding).
    ///
    /// An empty result means either end of file or, on a non-blocking
    /// channel, that the transport would have blocked; [`is_eof`] and
    /// [`is_blocked`] tell the two apart.
    ///
    /// [`is_eof`]: Channel::is_eof
    /// [`is_blocked`]: Channel::is_blocked
    pub fn read(self: &Rc<Self>, max: usize) -> io::Result<BytesMut> {
        self.check_not_copying()?;
        self.read_internal(max)
    }

    pub(crate) fn read_internal(self: &Rc<Self>, max: usize) -> io::Result<BytesMut> {
        self.begin_read()?;
        let mut out = BytesMut::new();
        loop {
            {
                let mut core = self.core.borrow_mut();
                consume_raw_translated(&mut core, &mut out, max);
            }
            if out.len() >= max {
                break;
            }
            let (eof, blocked, nonblocking) = {
                let core = self.core.borrow();
                (core.flags.eof, core.flags.blocked, core.flags.nonblocking)
            };
            if eof {
                let mut core = self.core.borrow_mut();
                let mut tail = [0u8; 1];
                let n = flush_input_eol(&mut core.in_eol, &mut tail);
                if n > 0 {
                    out.extend_from_slice(&tail[..n]);
                }
                break;
            }
            if blocked && nonblocking {
                break;
            }
            self.fill_input()?;
        }
        self.update_interest();
        Ok(out)
    }

    /// Reads up to `max_chars` characters of decoded, translated text.
    pub fn read_text(self: &Rc<Self>, max_chars: usize) -> io::Result<String> {
        self.check_not_copying()?;
        self.read_text_internal(max_chars)
    }

    pub(crate) fn read_text_internal(self: &Rc<Self>, max_chars: usize) -> io::Result<String> {
        self.begin_read()?;
        let mut out = String::new();
        let mut remaining = max_chars;
        loop {
            if remaining == 0 {
                break;
            }
            {
                let mut core = self.core.borrow_mut();
                remaining -= consume_decoded_translated(&mut core, &mut out, remaining, false);
            }
            if remaining == 0 {
                break;
            }
            let (eof, blocked, nonblocking) = {
                let core = self.core.borrow();
                (core.flags.eof, core.flags.blocked, core.flags.nonblocking)
            };
            if eof {
                let mut core = self.core.borrow_mut();
                remaining -= consume_decoded_translated(&mut core, &mut out, remaining, true);
                if remaining > 0 {
                    let mut tail = [0u8; 1];
                    let n = flush_input_eol(&mut core.in_eol, &mut tail);
                    if n > 0 {
                        push_utf8(&mut out, &tail[..n]);
                    }
                }
                break;
            }
            if blocked && nonblocking {
                break;
            }
            self.fill_input()?;
        }
        self.update_interest();
        Ok(out)
    }

    /// Reads one line of decoded, translated text.
    ///
    /// On success the terminator has been consumed but is not part of the
    /// returned string. At end of file an unterminated remainder is
    /// returned as the final line. `Ok(None)` means either end of file
    /// with nothing left, or, on a non-blocking channel, that no complete
    /// line is buffered yet; in the latter case the channel state is
    /// restored byte for byte, so nothing of the partial line is consumed,
    /// and the NEED-MORE-DATA flag keeps the notifier from spinning.
    pub fn read_line(self: &Rc<Self>) -> io::Result<Option<String>> {
        self.check_not_copying()?;
        self.read_line_internal()
    }

    pub(crate) fn read_line_internal(self: &Rc<Self>) -> io::Result<Option<String>> {
        self.begin_read()?;
        let mut line = String::new();
        let mut stash: Vec<(ChannelBuffer, usize)> = Vec::new();
        let snap = {
            let core = self.core.borrow();
            snapshot_input(&core)
        };

        loop {
            // Process everything currently buffered.
            let mut outcome = LineScan::NeedInput;
            {
                let mut core = self.core.borrow_mut();
                let core_ref = &mut *core;
                loop {
                    // Skip or stash drained head buffers.
                    match core_ref.in_queue.front().map(|b| b.is_empty()) {
                        None => break,
                        Some(true) => {
                            if core_ref.in_queue.len() > 1 {
                                pop_head_to_stash(core_ref, &mut stash, &snap);
                                continue;
                            }
                            break;
                        }
                        Some(false) => {}
                    }

                    let enc = text_encoding_of(core_ref);
                    let in_eof_char = core_ref.in_eof_char;
                    // Buffer size plus two bytes of slack, floored so one
                    // worst-case character always fits.
                    let staging_len = (core_ref.buffer_size + 2).max(8);
                    let in_translation = core_ref.in_translation;
                    let pre_decode = core_ref.decode_state;

                    let in_queue_len = core_ref.in_queue.len();
                    let head = match core_ref.in_queue.front_mut() {
                        Some(b) => b,
                        None => unreachable!(),
                    };
                    let (limit, found) = scan_eof_char(head.readable(), in_eof_char);
                    if limit == 0 {
                        if found {
                            core_ref.flags.eof = true;
                            core_ref.flags.sticky_eof = true;
                        }
                        break;
                    }

                    let mut staging = vec![0u8; staging_len];
                    let d = {
                        let src = &head.readable()[..limit];
                        decode(
                            enc,
                            &mut core_ref.decode_state,
                            src,
                            &mut staging,
                            usize::MAX,
                            false,
                        )
                    };

                    if d.consumed == 0 {
                        if d.needs_more && found {
                            // Partial character right before the EOF byte;
                            // resolved by the end-of-stream pass below.
                            core_ref.flags.eof = true;
                            core_ref.flags.sticky_eof = true;
                            break;
                        }
                        if d.needs_more && in_queue_len > 1 {
                            // Partial character at the end of this buffer;
                            // carry the tail into the next one.
                            let tail = head.readable()[..limit].to_vec();
                            head.consume(limit);
                            pop_head_to_stash(core_ref, &mut stash, &snap);
                            if let Some(next) = core_ref.in_queue.front_mut() {
                                next.prepend(&tail);
                            }
                            continue;
                        }
                        break;
                    }

                    let mut tmp = vec![0u8; d.produced + 1];
                    let t = translate_input_eol(
                        in_translation,
                        &mut core_ref.in_eol,
                        &staging[..d.produced],
                        &mut tmp,
                        true,
                    );

                    if t.terminated {
                        // Map the consumed translated prefix back to raw
                        // bytes by re-running the decode with a bounded
                        // destination; the prefix is deterministic.
                        let raw_used = if t.consumed == d.produced {
                            d.consumed
                        } else {
                            let mut st = pre_decode;
                            let mut scratch = vec![0u8; t.consumed];
                            let d2 = decode(
                                enc,
                                &mut st,
                                &head.readable()[..limit],
                                &mut scratch,
                                usize::MAX,
                                false,
                            );
                            core_ref.decode_state = st;
                            d2.consumed
                        };
                        let head = match core_ref.in_queue.front_mut() {
                            Some(b) => b,
                            None => unreachable!(),
                        };
                        head.consume(raw_used);
                        push_utf8(&mut line, &tmp[..t.produced - 1]);
                        try_consume_following_lf(core_ref);
                        outcome = LineScan::Complete;
                        break;
                    }

                    {
                        let head = match core_ref.in_queue.front_mut() {
                            Some(b) => b,
                            None => unreachable!(),
                        };
                        head.consume(d.consumed);
                    }
                    push_utf8(&mut line, &tmp[..t.produced]);
                    if found && d.consumed == limit {
                        // Everything up to the EOF byte is consumed; the
                        // end-of-file handling below finishes the line.
                        core_ref.flags.eof = true;
                        core_ref.flags.sticky_eof = true;
                        break;
                    }
                }
            }

            match outcome {
                LineScan::Complete => {
                    self.commit_line_read(stash);
                    self.update_interest();
                    return Ok(Some(line));
                }
                LineScan::NeedInput => {}
            }

            let (eof, blocked, nonblocking) = {
                let core = self.core.borrow();
                (core.flags.eof, core.flags.blocked, core.flags.nonblocking)
            };

            if eof {
                let mut core = self.core.borrow_mut();
                let core_ref = &mut *core;
                // A dangling partial character at real end of stream
                // decodes to the replacement character.
                let limit = match core_ref.in_queue.front() {
                    Some(h) if !h.is_empty() => {
                        scan_eof_char(h.readable(), core_ref.in_eof_char).0
                    }
                    _ => 0,
                };
                if limit > 0 {
                    let enc = text_encoding_of(core_ref);
                    let mut staging = vec![0u8; 16];
                    let head = match core_ref.in_queue.front_mut() {
                        Some(b) => b,
                        None => unreachable!(),
                    };
                    let d = {
                        let src = &head.readable()[..limit];
                        decode(
                            enc,
                            &mut core_ref.decode_state,
                            src,
                            &mut staging,
                            usize::MAX,
                            true,
                        )
                    };
                    head.consume(d.consumed);
                    push_utf8(&mut line, &staging[..d.produced]);
                }
                let mut tail = [0u8; 1];
                let n = flush_input_eol(&mut core_ref.in_eol, &mut tail);
                if n > 0 {
                    push_utf8(&mut line, &tail[..n]);
                }
                drop(core);
                self.commit_line_read(stash);
                self.update_interest();
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(line));
            }

            if blocked && nonblocking {
                let mut core = self.core.borrow_mut();
                rollback_input(&mut core, &snap, stash);
                // The restore puts back the pre-call flags, but this
                // attempt did block, and that must stay observable.
                core.flags.blocked = true;
                core.flags.need_more_data = true;
                drop(core);
                self.update_interest();
                return Ok(None);
            }

            if let Err(e) = self.fill_input() {
                let mut core = self.core.borrow_mut();
                rollback_input(&mut core, &snap, stash);
                return Err(e);
            }
        }
    }

    /// Releases buffers consumed by a successful line read.
    fn commit_line_read(&self, stash: Vec<(ChannelBuffer, usize)>) {
        let mut core = self.core.borrow_mut();
        let core_ref = &mut *core;
        for (buf, _) in stash {
            recycle_buffer(core_ref, buf, false);
        }
        core_ref.flags.need_more_data = false;
    }
}

enum LineScan {
    Complete,
    NeedInput,
}

/// Copies translated raw bytes (no decoding) from the input queue.
fn consume_raw_translated(core: &mut ChannelCore, out: &mut BytesMut, max: usize) {
    while out.len() < max {
        match core.in_queue.front().map(|b| b.is_empty()) {
            None => break,
            Some(true) => {
                if core.in_queue.len() > 1 {
                    if let Some(buf) = core.in_queue.pop_front() {
                        recycle_buffer(core, buf, false);
                    }
                    continue;
                }
                break;
            }
            Some(false) => {}
        }

        let mode = core.in_translation;
        let in_eof_char = core.in_eof_char;
        let buf = match core.in_queue.front_mut() {
            Some(b) => b,
            None => unreachable!(),
        };
        let (limit, found) = scan_eof_char(buf.readable(), in_eof_char);
        if limit == 0 {
            if found {
                core.flags.eof = true;
                core.flags.sticky_eof = true;
            }
            break;
        }

        let want = max - out.len();
        let mut tmp = vec![0u8; want.min(limit + 1)];
        let r = {
            let src = &buf.readable()[..limit];
            translate_input_eol(mode, &mut core.in_eol, src, &mut tmp, false)
        };
        buf.consume(r.consumed);
        out.extend_from_slice(&tmp[..r.produced]);

        if found && r.consumed == limit {
            core.flags.eof = true;
            core.flags.sticky_eof = true;
            break;
        }
        if r.consumed == 0 && r.produced == 0 {
            break;
        }
    }
}

/// Decodes and translates buffered input, appending to `out`; returns the
/// number of characters appended, never exceeding `max_chars`.
fn consume_decoded_translated(
    core: &mut ChannelCore,
    out: &mut String,
    max_chars: usize,
    end_of_stream: bool,
) -> usize {
    let mut got = 0;
    while got < max_chars {
        match core.in_queue.front().map(|b| b.is_empty()) {
            None => break,
            Some(true) => {
                if core.in_queue.len() > 1 {
                    if let Some(buf) = core.in_queue.pop_front() {
                        recycle_buffer(core, buf, false);
                    }
                    continue;
                }
                break;
            }
            Some(false) => {}
        }

        let enc = text_encoding_of(core);
        let in_eof_char = core.in_eof_char;
        let in_translation = core.in_translation;
        let staging_len = (core.buffer_size + 2).max(8);

        let in_queue_len = core.in_queue.len();
        let buf = match core.in_queue.front_mut() {
            Some(b) => b,
            None => unreachable!(),
        };
        let (limit, found) = scan_eof_char(buf.readable(), in_eof_char);
        if limit == 0 {
            if found {
                core.flags.eof = true;
                core.flags.sticky_eof = true;
            }
            break;
        }

        let mut staging = vec![0u8; staging_len];
        let budget = max_chars - got;
        let d = {
            let src = &buf.readable()[..limit];
            decode(
                enc,
                &mut core.decode_state,
                src,
                &mut staging,
                budget,
                end_of_stream,
            )
        };

        if d.consumed == 0 {
            if d.needs_more && found {
                core.flags.eof = true;
                core.flags.sticky_eof = true;
                break;
            }
            if d.needs_more && in_queue_len > 1 {
                let tail = buf.readable()[..limit].to_vec();
                buf.consume(limit);
                if let Some(empty) = core.in_queue.pop_front() {
                    recycle_buffer(core, empty, false);
                }
                if let Some(next) = core.in_queue.front_mut() {
                    next.prepend(&tail);
                }
                continue;
            }
            break;
        }
        buf.consume(d.consumed);

        let mut tmp = vec![0u8; d.produced + 1];
        let t = translate_input_eol(
            in_translation,
            &mut core.in_eol,
            &staging[..d.produced],
            &mut tmp,
            false,
        );
        debug_assert_eq!(t.consumed, d.produced);
        push_utf8(out, &tmp[..t.produced]);
        got += count_chars(&tmp[..t.produced]);

        if found && d.consumed == limit {
            core.flags.eof = true;
            core.flags.sticky_eof = true;
            break;
        }
    }
    got
}
