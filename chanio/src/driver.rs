//! Definition of the core `Driver` trait and the readiness types shared
//! between the channel core and transport implementations.
//!
//! A [`Driver`] is the pluggable transport under a channel. It is the only
//! thing a transport author has to provide: the channel core layers
//! buffering, end-of-line translation, encoding conversion, stacking and
//! event dispatch on top of it. The contract is deliberately small and
//! synchronous. A driver never suspends by itself; in non-blocking mode it
//! reports would-block through [`std::io::ErrorKind::WouldBlock`] and the
//! core expresses all waiting as "register interest, return, resume later".

use std::io::{self, SeekFrom};
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// Transfer direction of a channel endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// The read side.
    Input,
    /// The write side.
    Output,
}

/// Readiness/interest bit mask.
///
/// Used both as the interest a channel asks its driver to watch for and as
/// the readiness a driver (or an embedding event loop) reports back through
/// [`notify_channel`](crate::notify_channel).
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Ready(u8);

impl Ready {
    /// No readiness.
    pub const NONE: Self = Self(0);
    /// The channel can be read without blocking.
    pub const READABLE: Self = Self(1 << 0);
    /// The channel can be written without blocking.
    pub const WRITABLE: Self = Self(1 << 1);

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `self` with the bits of `other` removed.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Shorthand for `self.contains(Ready::READABLE)`.
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// Shorthand for `self.contains(Ready::WRITABLE)`.
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

/// The operation set a transport supplies to the channel core.
///
/// # Error conventions
///
/// * `input` returning `Ok(0)` means end of file.
/// * [`io::ErrorKind::WouldBlock`] means the operation cannot proceed right
///   now; it is only legal while the driver is in non-blocking mode. A
///   driver that was told to block and reports would-block anyway violates
///   the contract and the core treats it as a fatal bug.
/// * [`io::ErrorKind::Interrupted`] is transient; the core retries.
/// * Any other error is reported to the caller, or latched by the channel
///   when it happens during a background operation.
pub trait Driver {
    /// A short name identifying the transport type, for diagnostics.
    fn kind(&self) -> &'static str;

    /// Reads up to `dst.len()` bytes from the device into `dst`.
    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize>;

    /// Writes bytes from `src` to the device, returning how many were
    /// accepted. Short writes are not errors.
    fn output(&mut self, src: &[u8]) -> io::Result<usize>;

    /// Releases the device. Called exactly once, at channel teardown.
    fn close(&mut self) -> io::Result<()>;

    /// Closes only one side of a bidirectional device.
    ///
    /// Only called when [`supports_half_close`](Driver::supports_half_close)
    /// returns true.
    fn half_close(&mut self, _side: Direction) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// Whether [`half_close`](Driver::half_close) is available.
    fn supports_half_close(&self) -> bool {
        false
    }

    /// Repositions the device, returning the new absolute offset.
    ///
    /// The default implementation reports the channel as unseekable.
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::from_raw_os_error(libc::ESPIPE))
    }

    /// Whether [`seek`](Driver::seek) is available.
    fn is_seekable(&self) -> bool {
        false
    }

    /// Switches the device between blocking and non-blocking mode.
    fn set_blocking(&mut self, blocking: bool) -> io::Result<()>;

    /// Tells the device which readiness conditions the channel currently
    /// cares about. Called after every interest recomputation; `interest`
    /// replaces, not extends, the previous mask.
    fn watch(&mut self, interest: Ready);

    /// Exposes the OS-level handle for the given direction, when one
    /// exists, so an embedding event loop can poll it.
    fn handle(&self, _dir: Direction) -> Option<RawFd> {
        None
    }

    /// Reads a driver-specific option.
    fn get_option(&self, _name: &str) -> Option<String> {
        None
    }

    /// Sets a driver-specific option.
    fn set_option(&mut self, _name: &str, _value: &str) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }
}

/// Placeholder driver installed while a binding is being moved between
/// records during stacking. Every operation fails; nothing should reach it.
pub(crate) struct DetachedDriver;

impl Driver for DetachedDriver {
    fn kind(&self) -> &'static str {
        "detached"
    }

    fn input(&mut self, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EBADF))
    }

    fn output(&mut self, _src: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EBADF))
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_blocking(&mut self, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn watch(&mut self, _interest: Ready) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_mask_ops() {
        let both = Ready::READABLE | Ready::WRITABLE;
        assert!(both.contains(Ready::READABLE));
        assert!(both.contains(Ready::WRITABLE));
        assert!(both.intersects(Ready::READABLE));
        assert!(!Ready::READABLE.intersects(Ready::WRITABLE));
        assert!(both.without(Ready::WRITABLE) == Ready::READABLE);
        assert!(Ready::NONE.is_empty());
        assert!(!both.is_empty());
    }
}
