//! Seek and tell over buffered channels.
//!
//! A channel that simultaneously holds unread input and unflushed output
//! has no single answerable position, so both operations fail with a
//! fault-style error in that state. Seeking discards buffered input (it
//! is positionally invalid afterwards) and flushes buffered output first,
//! with blocking mode temporarily forced so the flush cannot go into the
//! background mid-seek.

use std::io::{self, SeekFrom};
use std::rc::Rc;

use crate::channel::{posix_err, Channel};
use crate::encoding::DecodeState;
use crate::output::queue_cur_out;
use crate::translate::InputEolState;

impl Channel {
    /// Repositions the channel, returning the new absolute offset.
    ///
    /// Fails with `ESPIPE` on unseekable transports, `EFAULT` when both
    /// input and output hold buffered bytes, and `EBUSY` while a copy
    /// owns the channel. Clears end-of-file state, including a sticky
    /// in-stream EOF.
    pub fn seek(self: &Rc<Self>, pos: SeekFrom) -> io::Result<u64> {
        self.check_not_copying()?;
        {
            let mut core = self.core.borrow_mut();
            if core.flags.dead || core.flags.closed {
                return Err(posix_err(libc::EBADF));
            }
            if let Some(err) = core.unreported.take() {
                return Err(err);
            }
            core.flags.blocked = false;
            if !core.driver.is_seekable() {
                return Err(posix_err(libc::ESPIPE));
            }
            if core.input_buffered() > 0 && core.output_buffered() > 0 {
                return Err(posix_err(libc::EFAULT));
            }
        }

        // A relative seek is expressed against the position the consumer
        // observes, which trails the raw position by the buffered input.
        let pos = {
            let core = self.core.borrow();
            match pos {
                SeekFrom::Current(off) => {
                    SeekFrom::Current(off - core.input_buffered() as i64)
                }
                other => other,
            }
        };

        let forced = self.force_blocking()?;
        {
            let mut core = self.core.borrow_mut();
            queue_cur_out(&mut core);
        }
        if let Err(e) = self.flush_channel(false) {
            self.restore_nonblocking(forced);
            return Err(e);
        }

        let result = {
            let mut core = self.core.borrow_mut();
            core.in_queue.clear();
            core.spare_in = None;
            core.in_eol = InputEolState::default();
            core.decode_state = DecodeState::default();
            core.flags.eof = false;
            core.flags.sticky_eof = false;
            core.driver.seek(pos)
        };
        self.restore_nonblocking(forced);
        self.update_interest();
        result
    }

    /// Reports the position the consumer observes: the raw device
    /// position minus still-buffered unread input, plus still-buffered
    /// unflushed output.
    pub fn tell(&self) -> io::Result<u64> {
        let mut core = self.core.borrow_mut();
        if core.flags.dead || core.flags.closed {
            return Err(posix_err(libc::EBADF));
        }
        if !core.driver.is_seekable() {
            return Err(posix_err(libc::ESPIPE));
        }
        let input = core.input_buffered();
        let output = core.output_buffered();
        if input > 0 && output > 0 {
            return Err(posix_err(libc::EFAULT));
        }
        let raw = core.driver.seek(SeekFrom::Current(0))?;
        Ok(raw.saturating_sub(input as u64) + output as u64)
    }
}
