//! The background copy engine: chunked transfer between two channels,
//! driven synchronously or by readiness events.
//!
//! A copy owns both channels for its duration; any other operation on
//! either fails with `EBUSY`. The asynchronous form (a completion
//! callback was supplied) forces both channels non-blocking and parks
//! itself on readiness handlers whenever the source runs dry or the
//! destination falls into background flush; the synchronous form forces
//! both blocking and runs to completion inline. Either way the
//! destination is unbuffered for the duration and both channels get
//! their previous modes back at the end.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use log::{debug, warn};

use crate::channel::{posix_err, BufferMode, Channel};
use crate::driver::Ready;
use crate::events::HandlerId;

/// Completion callback of an asynchronous copy: total bytes transferred
/// and the error that ended the copy, if any.
pub type CopyCallback = Box<dyn FnOnce(u64, Option<io::Error>)>;

/// State of one copy operation, shared by both channels and by the
/// readiness handlers that resume it.
pub struct CopyState {
    src: Rc<Channel>,
    dst: Rc<Channel>,
    remaining: Option<u64>,
    total: u64,
    done: Option<CopyCallback>,
    background: bool,
    src_was_nonblocking: bool,
    dst_was_nonblocking: bool,
    dst_buffering: BufferMode,
    read_handler: Option<HandlerId>,
    write_handler: Option<HandlerId>,
}

enum CopyOutcome {
    Finished(u64, Option<io::Error>),
    Suspended,
}

/// Copies up to `limit` bytes (or everything until EOF) from `src` to
/// `dst`.
///
/// With a completion callback the copy is asynchronous: this returns
/// `Ok(None)` immediately and the callback later receives the total and
/// any error, possibly before this even returns if the copy finishes in
/// one pass. Without a callback the copy is synchronous and the total is
/// returned directly.
///
/// Fails with `EBUSY` if either channel already has a copy in progress
/// and with `EACCES` if `src` is not readable or `dst` not writable; in
/// those cases nothing was changed on either channel.
pub fn copy_channel(
    src: &Rc<Channel>,
    dst: &Rc<Channel>,
    limit: Option<u64>,
    done: Option<CopyCallback>,
) -> io::Result<Option<u64>> {
    if src.core.borrow().copy.is_some() || dst.core.borrow().copy.is_some() {
        return Err(posix_err(libc::EBUSY));
    }
    if !src.is_readable() || !dst.is_writable() {
        return Err(posix_err(libc::EACCES));
    }

    let background = done.is_some();
    let src_was_nonblocking = src.is_nonblocking();
    let dst_was_nonblocking = dst.is_nonblocking();
    let dst_buffering = dst.buffering();

    src.set_blocking(!background)?;
    if let Err(e) = dst.set_blocking(!background) {
        let _ = src.set_blocking(!src_was_nonblocking);
        return Err(e);
    }
    dst.set_buffering(BufferMode::None);

    let state = Rc::new(RefCell::new(CopyState {
        src: Rc::clone(src),
        dst: Rc::clone(dst),
        remaining: limit,
        total: 0,
        done,
        background,
        src_was_nonblocking,
        dst_was_nonblocking,
        dst_buffering,
        read_handler: None,
        write_handler: None,
    }));
    src.core.borrow_mut().copy = Some(Rc::clone(&state));
    dst.core.borrow_mut().copy = Some(Rc::clone(&state));
    debug!(
        "copy {:?} -> {:?} starting (limit {:?})",
        src.name(),
        dst.name(),
        limit
    );

    let outcome = copy_data(&state);
    if background {
        return Ok(None);
    }
    match outcome {
        CopyOutcome::Finished(total, None) => Ok(Some(total)),
        CopyOutcome::Finished(_, Some(e)) => Err(e),
        CopyOutcome::Suspended => unreachable!("synchronous copy cannot suspend"),
    }
}

/// One pump of the copy loop. Runs until the limit or EOF is reached, an
/// error occurs, or (asynchronously) until one side exerts backpressure.
fn copy_data(cs: &Rc<RefCell<CopyState>>) -> CopyOutcome {
    loop {
        let (src, dst, background, chunk) = {
            let s = cs.borrow();
            let chunk = match s.remaining {
                None => s.src.buffer_size(),
                Some(r) => r.min(s.src.buffer_size() as u64) as usize,
            };
            (Rc::clone(&s.src), Rc::clone(&s.dst), s.background, chunk)
        };
        if chunk == 0 {
            return finish_copy(cs, None);
        }

        let data = match src.read_internal(chunk) {
            Ok(d) => d,
            Err(e) => return finish_copy(cs, Some(e)),
        };

        if data.is_empty() {
            if src.is_eof() {
                return finish_copy(cs, None);
            }
            if background {
                ensure_read_handler(cs, &src);
                return CopyOutcome::Suspended;
            }
            // A blocking source produced nothing without reporting EOF.
            return finish_copy(cs, Some(posix_err(libc::EIO)));
        }

        if let Err(e) = dst.write_internal(&data) {
            return finish_copy(cs, Some(e));
        }

        let limit_reached = {
            let mut s = cs.borrow_mut();
            s.total += data.len() as u64;
            if let Some(r) = s.remaining.as_mut() {
                *r -= data.len() as u64;
            }
            s.remaining == Some(0)
        };
        if limit_reached {
            return finish_copy(cs, None);
        }

        if background && dst.core.borrow().flags.bg_flush_scheduled {
            ensure_write_handler(cs, &dst);
            return CopyOutcome::Suspended;
        }
    }
}

fn ensure_read_handler(cs: &Rc<RefCell<CopyState>>, src: &Rc<Channel>) {
    if cs.borrow().read_handler.is_some() {
        return;
    }
    let resume = Rc::clone(cs);
    let id = src.add_handler(Ready::READABLE, move |_mask| {
        let _ = copy_data(&resume);
    });
    cs.borrow_mut().read_handler = Some(id);
}

fn ensure_write_handler(cs: &Rc<RefCell<CopyState>>, dst: &Rc<Channel>) {
    if cs.borrow().write_handler.is_some() {
        return;
    }
    let resume = Rc::clone(cs);
    let id = dst.add_handler(Ready::WRITABLE, move |_mask| {
        let _ = copy_data(&resume);
    });
    cs.borrow_mut().write_handler = Some(id);
}

/// Ends the copy: detaches handlers, releases both channels, restores
/// their modes, and delivers the result.
fn finish_copy(cs: &Rc<RefCell<CopyState>>, err: Option<io::Error>) -> CopyOutcome {
    let (src, dst, total, done, background, src_nb, dst_nb, dst_buf, rh, wh) = {
        let mut s = cs.borrow_mut();
        (
            Rc::clone(&s.src),
            Rc::clone(&s.dst),
            s.total,
            s.done.take(),
            s.background,
            s.src_was_nonblocking,
            s.dst_was_nonblocking,
            s.dst_buffering,
            s.read_handler.take(),
            s.write_handler.take(),
        )
    };
    if let Some(id) = rh {
        src.remove_handler(id);
    }
    if let Some(id) = wh {
        dst.remove_handler(id);
    }
    src.core.borrow_mut().copy = None;
    dst.core.borrow_mut().copy = None;
    let _ = src.set_blocking(!src_nb);
    let _ = dst.set_blocking(!dst_nb);
    dst.set_buffering(dst_buf);

    match &err {
        Some(e) => warn!(
            "copy {:?} -> {:?} failed after {} bytes: {}",
            src.name(),
            dst.name(),
            total,
            e
        ),
        None => debug!(
            "copy {:?} -> {:?} complete ({} bytes)",
            src.name(),
            dst.name(),
            total
        ),
    }

    if background {
        if let Some(callback) = done {
            callback(total, err);
        }
        CopyOutcome::Finished(total, None)
    } else {
        CopyOutcome::Finished(total, err)
    }
}
