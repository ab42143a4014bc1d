//! Readiness handlers, interest computation, and event dispatch.
//!
//! After most operations a channel recomputes the OS-level readiness it
//! still needs and passes the mask to [`Driver::watch`]. Read interest is
//! special-cased: if already-buffered input is sitting in the head buffer
//! the driver cannot be relied on to report readiness for data it did not
//! itself just deliver, so read interest is suppressed and a zero-delay
//! timer on the [`IoContext`](crate::IoContext) re-notifies instead. That
//! keeps the event loop from blocking while data is ready to hand back,
//! without busy-spinning when a line read is waiting for more bytes.
//!
//! Dispatch is reentrancy safe: handlers are invoked from a snapshot
//! taken at dispatch start and each is revalidated by id right before its
//! call, so a handler may add or remove handlers, or close the channel,
//! while dispatch is running.
//!
//! [`Driver::watch`]: crate::Driver::watch

use std::rc::Rc;

use crate::channel::Channel;
use crate::driver::Ready;

/// Identifier of a registered readiness handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandlerId(pub(crate) u64);

/// One registered readiness callback.
pub(crate) struct HandlerRecord {
    pub id: u64,
    pub interest: Ready,
    pub callback: Rc<dyn Fn(Ready)>,
}

impl Channel {
    /// Registers a readiness handler and recomputes driver interest.
    ///
    /// The callback runs from [`notify_channel`] whenever the reported
    /// readiness intersects `interest`. It may freely call back into the
    /// channel, including removing handlers or closing it.
    pub fn add_handler(
        self: &Rc<Self>,
        interest: Ready,
        callback: impl Fn(Ready) + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id.get();
        self.next_handler_id.set(id + 1);
        self.handlers.borrow_mut().push(HandlerRecord {
            id,
            interest,
            callback: Rc::new(callback),
        });
        self.update_interest();
        HandlerId(id)
    }

    /// Changes the interest mask of a registered handler. Returns false
    /// if the handler no longer exists.
    pub fn update_handler(self: &Rc<Self>, id: HandlerId, interest: Ready) -> bool {
        let found = {
            let mut handlers = self.handlers.borrow_mut();
            match handlers.iter_mut().find(|h| h.id == id.0) {
                Some(h) => {
                    h.interest = interest;
                    true
                }
                None => false,
            }
        };
        if found {
            self.update_interest();
        }
        found
    }

    /// Removes a readiness handler. Safe to call from inside a handler,
    /// including for a handler that has not run yet in this dispatch.
    pub fn remove_handler(self: &Rc<Self>, id: HandlerId) {
        self.handlers.borrow_mut().retain(|h| h.id != id.0);
        self.update_interest();
    }

    /// Recomputes the readiness mask the driver should watch for and
    /// passes it to the driver.
    ///
    /// Write interest is present whenever a background flush is
    /// scheduled. Read interest follows the registered handlers, except
    /// that buffered unconsumed input suppresses it in favor of a
    /// zero-delay timer on the context, unless a short line read marked
    /// the channel as needing more data first.
    pub fn update_interest(self: &Rc<Self>) {
        let ctx = self.context.borrow().upgrade();
        let mut arm_timer = false;
        {
            let mut core = self.core.borrow_mut();
            if core.flags.dead {
                return;
            }
            let mut interest = Ready::NONE;
            for h in self.handlers.borrow().iter() {
                interest |= h.interest;
            }
            if core.flags.bg_flush_scheduled {
                interest |= Ready::WRITABLE;
            }
            if interest.is_readable() {
                let buffered = core.in_queue.front().map_or(false, |b| !b.is_empty());
                if buffered && !core.flags.need_more_data && ctx.is_some() {
                    interest = interest.without(Ready::READABLE);
                    arm_timer = true;
                }
            }
            core.driver.watch(interest);
        }
        if arm_timer {
            if let Some(ctx) = ctx {
                ctx.arm_ready_timer(self);
            }
        }
    }
}

/// Delivers driver-reported readiness to a channel stack.
///
/// Walks the stack outward to inward, most recently stacked level first.
/// At each level a scheduled background flush runs synchronously before
/// anything else and clears the write bit from the delivered mask; then
/// every handler whose interest intersects the mask is invoked; then the
/// level's interest is recomputed and the walk descends to the channel it
/// supersedes. The walk stops as soon as a handler has closed the
/// channel.
pub fn notify_channel(channel: &Rc<Channel>, mask: Ready) {
    let mut level = Rc::clone(channel);
    let mut mask = mask;
    loop {
        let bg = {
            let core = level.core.borrow();
            if core.flags.dead {
                return;
            }
            core.flags.bg_flush_scheduled
        };
        if bg && mask.is_writable() {
            let _ = level.flush_channel(true);
            mask = mask.without(Ready::WRITABLE);
        }

        let snapshot: Vec<(u64, Rc<dyn Fn(Ready)>)> = level
            .handlers
            .borrow()
            .iter()
            .filter(|h| h.interest.intersects(mask))
            .map(|h| (h.id, Rc::clone(&h.callback)))
            .collect();
        for (id, callback) in snapshot {
            if level.core.borrow().flags.dead {
                return;
            }
            let still_registered = level.handlers.borrow().iter().any(|h| h.id == id);
            if still_registered {
                callback(mask);
            }
        }

        if level.core.borrow().flags.dead {
            return;
        }
        level.update_interest();

        let below = level.core.borrow().supersedes.clone();
        match below {
            Some(next) => level = next,
            None => return,
        }
    }
}
