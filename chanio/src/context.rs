//! The per-thread I/O context: open-channel registry, standard stream
//! slots, and the zero-delay readiness timers.
//!
//! Everything the original design kept in thread-local statics lives in
//! an explicit [`IoContext`] value with explicit lifecycle: create one
//! per event loop, open or adopt channels into it, and pump
//! [`run_ready_timers`](IoContext::run_ready_timers) from the loop so
//! channels with already-buffered input are serviced even when their
//! driver has nothing new to report.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::{Rc, Weak};

use log::trace;

use crate::channel::{posix_err, Channel};
use crate::driver::{Driver, Ready};
use crate::events::notify_channel;

/// One of the three standard stream slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StdStream {
    /// Standard input.
    In,
    /// Standard output.
    Out,
    /// Standard error.
    Error,
}

impl StdStream {
    fn index(self) -> usize {
        match self {
            StdStream::In => 0,
            StdStream::Out => 1,
            StdStream::Error => 2,
        }
    }
}

/// Registry and notifier bookkeeping for one thread's channels.
pub struct IoContext {
    channels: RefCell<HashMap<String, Rc<Channel>>>,
    std_slots: RefCell<[Option<Rc<Channel>>; 3]>,
    ready_timers: RefCell<VecDeque<Weak<Channel>>>,
}

impl IoContext {
    /// Creates an empty context.
    pub fn new() -> Rc<IoContext> {
        Rc::new(IoContext {
            channels: RefCell::new(HashMap::new()),
            std_slots: RefCell::new([None, None, None]),
            ready_timers: RefCell::new(VecDeque::new()),
        })
    }

    /// Creates a channel attached to this context. The channel is not
    /// registered yet; see [`register`](IoContext::register).
    pub fn open(
        self: &Rc<Self>,
        name: impl Into<String>,
        driver: Box<dyn Driver>,
        mode: Ready,
    ) -> io::Result<Rc<Channel>> {
        let chan = Channel::new(name, driver, mode)?;
        *chan.context.borrow_mut() = Rc::downgrade(self);
        Ok(chan)
    }

    /// Attaches an externally created channel to this context so it can
    /// use the readiness timers and the registry.
    pub fn adopt(self: &Rc<Self>, chan: &Rc<Channel>) {
        *chan.context.borrow_mut() = Rc::downgrade(self);
    }

    /// Registers a channel under its name, taking one reference. A name
    /// can only be held by one channel at a time.
    pub fn register(&self, chan: &Rc<Channel>) -> io::Result<()> {
        let mut map = self.channels.borrow_mut();
        if let Some(existing) = map.get(chan.name()) {
            if !Rc::ptr_eq(existing, chan) {
                return Err(posix_err(libc::EEXIST));
            }
        }
        map.insert(chan.name().to_string(), Rc::clone(chan));
        chan.retain();
        trace!("registered channel {:?}", chan.name());
        Ok(())
    }

    /// Drops one reference to a registered channel. When the last
    /// reference goes, the channel is removed from the registry and
    /// closed.
    pub fn unregister(&self, chan: &Rc<Channel>) -> io::Result<()> {
        if chan.release() > 0 {
            return Ok(());
        }
        self.channels.borrow_mut().remove(chan.name());
        let mut slots = self.std_slots.borrow_mut();
        for slot in slots.iter_mut() {
            if slot.as_ref().map_or(false, |c| Rc::ptr_eq(c, chan)) {
                *slot = None;
            }
        }
        drop(slots);
        trace!("last reference to channel {:?} dropped, closing", chan.name());
        chan.close()
    }

    /// Looks a registered channel up by name.
    pub fn channel(&self, name: &str) -> Option<Rc<Channel>> {
        self.channels.borrow().get(name).cloned()
    }

    /// Names of all registered channels, in no particular order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.borrow().keys().cloned().collect()
    }

    /// Installs (or clears) a standard stream slot.
    pub fn set_std_channel(&self, which: StdStream, chan: Option<Rc<Channel>>) {
        self.std_slots.borrow_mut()[which.index()] = chan;
    }

    /// The channel currently occupying a standard stream slot.
    pub fn std_channel(&self, which: StdStream) -> Option<Rc<Channel>> {
        self.std_slots.borrow()[which.index()].clone()
    }

    /// Queues a zero-delay readiness timer for a channel whose head
    /// buffer already holds data. Idempotent per channel.
    pub(crate) fn arm_ready_timer(&self, chan: &Rc<Channel>) {
        if chan.timer_armed.get() {
            return;
        }
        chan.timer_armed.set(true);
        self.ready_timers.borrow_mut().push_back(Rc::downgrade(chan));
    }

    /// Whether any readiness timer is pending. An event loop with
    /// pending timers must not block in its poll.
    pub fn has_pending_timers(&self) -> bool {
        !self.ready_timers.borrow().is_empty()
    }

    /// Fires all queued readiness timers, re-notifying READABLE on every
    /// channel that still has buffered input and a read-interested
    /// handler. Returns how many notifications were delivered.
    pub fn run_ready_timers(&self) -> usize {
        let pending: Vec<Weak<Channel>> = self.ready_timers.borrow_mut().drain(..).collect();
        let mut fired = 0;
        for weak in pending {
            let chan = match weak.upgrade() {
                Some(c) => c,
                None => continue,
            };
            chan.timer_armed.set(false);
            let (buffered, need_more, dead) = {
                let core = chan.core.borrow();
                (
                    core.in_queue.front().map_or(false, |b| !b.is_empty()),
                    core.flags.need_more_data,
                    core.flags.dead,
                )
            };
            if dead {
                continue;
            }
            let wants_read = chan
                .handlers
                .borrow()
                .iter()
                .any(|h| h.interest.is_readable());
            if buffered && !need_more && wants_read {
                notify_channel(&chan, Ready::READABLE);
                fired += 1;
            } else {
                chan.update_interest();
            }
        }
        fired
    }

    /// Detaches a channel at teardown time, if it is still in the
    /// registry or a standard slot.
    pub(crate) fn forget(&self, chan: &Channel) {
        let mut map = self.channels.borrow_mut();
        if let Some(existing) = map.get(chan.name()) {
            if std::ptr::eq(Rc::as_ptr(existing), chan as *const Channel) {
                map.remove(chan.name());
            }
        }
        drop(map);
        let mut slots = self.std_slots.borrow_mut();
        for slot in slots.iter_mut() {
            if slot
                .as_ref()
                .map_or(false, |c| std::ptr::eq(Rc::as_ptr(c), chan as *const Channel))
            {
                *slot = None;
            }
        }
    }
}
