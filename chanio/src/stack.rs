//! Transparent stacking of filter channels.
//!
//! Stacking pushes a transform in front of an existing channel without
//! changing the handle anyone holds: the handle is a stable wrapper and
//! only its binding is retargeted. The current binding (driver, queued
//! buffers, EOF bytes, carry state) moves into a hidden covered record
//! that the filter driver reads and writes through; the public handle
//! keeps its registration count, handlers, close hooks, and the
//! translation, encoding, and buffering configuration in effect, because
//! the filter now owns those semantics. The covered half is reset to raw
//! binary with no buffering.
//!
//! Unstacking is the mirror image: the covered binding moves back into
//! the handle (which keeps the configuration the filter was using), and
//! the filter's detached state gets a normal close, with its pending
//! output flushed through the filter driver first and its unread input
//! discarded.

use std::io;
use std::mem;
use std::rc::Rc;

use log::debug;

use crate::channel::{posix_err, BufferMode, Channel, ChannelCore, Flags};
use crate::driver::{DetachedDriver, Driver, Ready};
use crate::encoding::{DecodeState, EncodeState, TextEncoding};
use crate::output::queue_cur_out;
use crate::translate::Translation;

impl Channel {
    /// Pushes a filter in front of this channel.
    ///
    /// `make_driver` receives the handle of the covered channel so the
    /// transform can read from and write to the layer it covers; the
    /// driver it returns becomes this channel's new binding. `mode`
    /// restricts the filter's direction set and must be a subset of the
    /// channel's. Returns the covered handle (also reachable through the
    /// stack itself; most callers can ignore it).
    pub fn stack<F>(self: &Rc<Self>, mode: Ready, make_driver: F) -> io::Result<Rc<Channel>>
    where
        F: FnOnce(Rc<Channel>) -> Box<dyn Driver>,
    {
        {
            let core = self.core.borrow();
            if core.flags.dead || core.flags.closed {
                return Err(posix_err(libc::EBADF));
            }
            if core.copy.is_some() {
                return Err(posix_err(libc::EBUSY));
            }
            if mode.is_empty()
                || (mode.is_readable() && !core.flags.readable)
                || (mode.is_writable() && !core.flags.writable)
            {
                return Err(posix_err(libc::EINVAL));
            }
        }

        let covered_core = {
            let mut core = self.core.borrow_mut();
            let core_ref = &mut *core;
            let old_driver = mem::replace(&mut core_ref.driver, Box::new(DetachedDriver));
            let covered = ChannelCore {
                driver: old_driver,
                flags: Flags {
                    readable: core_ref.flags.readable,
                    writable: core_ref.flags.writable,
                    nonblocking: core_ref.flags.nonblocking,
                    buffer_ready: core_ref.flags.buffer_ready,
                    bg_flush_scheduled: core_ref.flags.bg_flush_scheduled,
                    eof: core_ref.flags.eof,
                    sticky_eof: core_ref.flags.sticky_eof,
                    blocked: core_ref.flags.blocked,
                    need_more_data: false,
                    closed: false,
                    dead: false,
                },
                buffer_size: core_ref.buffer_size,
                buffering: BufferMode::None,
                in_queue: mem::take(&mut core_ref.in_queue),
                spare_in: core_ref.spare_in.take(),
                cur_out: core_ref.cur_out.take(),
                out_queue: mem::take(&mut core_ref.out_queue),
                in_translation: Translation::Lf,
                out_translation: Translation::Lf,
                in_eof_char: core_ref.in_eof_char.take(),
                out_eof_char: core_ref.out_eof_char.take(),
                encoding: TextEncoding::Binary,
                decode_state: DecodeState::default(),
                encode_state: EncodeState::default(),
                in_eol: mem::take(&mut core_ref.in_eol),
                out_eol: mem::take(&mut core_ref.out_eol),
                unreported: core_ref.unreported.take(),
                supersedes: core_ref.supersedes.take(),
                copy: None,
            };
            // The filter starts with clean transient state; its
            // translation, encoding, and buffering configuration stay as
            // they were on the original.
            core_ref.flags.eof = false;
            core_ref.flags.sticky_eof = false;
            core_ref.flags.blocked = false;
            core_ref.flags.buffer_ready = false;
            core_ref.flags.bg_flush_scheduled = false;
            core_ref.flags.need_more_data = false;
            core_ref.decode_state = DecodeState::default();
            core_ref.encode_state = EncodeState::default();
            covered
        };

        let covered = Channel::from_core(format!("{}~covered", self.name()), covered_core);
        *covered.context.borrow_mut() = self.context.borrow().clone();

        let filter_driver = make_driver(Rc::clone(&covered));
        {
            let mut core = self.core.borrow_mut();
            core.driver = filter_driver;
            core.flags.readable = mode.is_readable();
            core.flags.writable = mode.is_writable();
            core.supersedes = Some(Rc::clone(&covered));
        }
        debug!(
            "stacked filter over channel {:?} ({} level(s) below)",
            self.name(),
            self.stack_depth()
        );
        self.update_interest();
        Ok(covered)
    }

    /// Removes the topmost filter, restoring the covered binding into
    /// this handle.
    ///
    /// The filter's buffered output is flushed through its driver before
    /// the swap (blocking mode is forced for the flush); its unread input
    /// is discarded with the rest of its detached state.
    pub fn unstack(self: &Rc<Self>) -> io::Result<()> {
        {
            let core = self.core.borrow();
            if core.flags.dead || core.flags.closed {
                return Err(posix_err(libc::EBADF));
            }
            if core.copy.is_some() {
                return Err(posix_err(libc::EBUSY));
            }
            if core.supersedes.is_none() {
                return Err(posix_err(libc::EINVAL));
            }
        }

        let forced = self.force_blocking()?;
        {
            let mut core = self.core.borrow_mut();
            queue_cur_out(&mut core);
        }
        let flush_result = self.flush_channel(false);
        self.restore_nonblocking(forced);
        flush_result?;

        let mut filter_driver: Box<dyn Driver> = {
            let mut core = self.core.borrow_mut();
            let core_ref = &mut *core;
            let covered = match core_ref.supersedes.take() {
                Some(c) => c,
                None => unreachable!(),
            };
            let mut below = covered.core.borrow_mut();
            let below_ref = &mut *below;
            // The covered half always runs binary; the swap logic relies
            // on it (assumed contract, not enforced at stack time).
            debug_assert!(matches!(below_ref.encoding, TextEncoding::Binary));

            let filter_driver = mem::replace(
                &mut core_ref.driver,
                mem::replace(&mut below_ref.driver, Box::new(DetachedDriver)),
            );
            core_ref.in_queue = mem::take(&mut below_ref.in_queue);
            core_ref.spare_in = below_ref.spare_in.take();
            core_ref.cur_out = below_ref.cur_out.take();
            core_ref.out_queue = mem::take(&mut below_ref.out_queue);
            core_ref.flags.readable = below_ref.flags.readable;
            core_ref.flags.writable = below_ref.flags.writable;
            core_ref.flags.eof = below_ref.flags.eof;
            core_ref.flags.sticky_eof = below_ref.flags.sticky_eof;
            core_ref.flags.blocked = below_ref.flags.blocked;
            core_ref.flags.buffer_ready = below_ref.flags.buffer_ready;
            core_ref.flags.bg_flush_scheduled = below_ref.flags.bg_flush_scheduled;
            core_ref.in_eof_char = below_ref.in_eof_char.take();
            core_ref.out_eof_char = below_ref.out_eof_char.take();
            core_ref.in_eol = mem::take(&mut below_ref.in_eol);
            core_ref.out_eol = mem::take(&mut below_ref.out_eol);
            if core_ref.unreported.is_none() {
                core_ref.unreported = below_ref.unreported.take();
            }
            core_ref.supersedes = below_ref.supersedes.take();
            below_ref.flags.closed = true;
            below_ref.flags.dead = true;

            // The uncovered driver may disagree with the channel's
            // current blocking mode; bring it in line.
            let nonblocking = core_ref.flags.nonblocking;
            let _ = core_ref.driver.set_blocking(!nonblocking);
            filter_driver
        };

        let _ = filter_driver.close();
        debug!("unstacked filter from channel {:?}", self.name());
        self.update_interest();
        Ok(())
    }

    /// Number of channels stacked below this one.
    pub fn stack_depth(&self) -> usize {
        let mut depth = 0;
        let mut below = self.core.borrow().supersedes.clone();
        while let Some(chan) = below {
            depth += 1;
            below = chan.core.borrow().supersedes.clone();
        }
        depth
    }
}
