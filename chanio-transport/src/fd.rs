//! Unix file-descriptor transport: files and pipes through `libc`.

use std::ffi::CString;
use std::io::{self, SeekFrom};
use std::os::unix::io::RawFd;

use log::trace;

use chanio::{Direction, Driver, Ready};

/// Driver over a raw Unix file descriptor.
pub struct FdDriver {
    fd: RawFd,
    owned: bool,
}

impl FdDriver {
    /// Opens a path with the given `open(2)` flags and mode.
    pub fn open(path: &str, flags: i32, mode: i32) -> io::Result<FdDriver> {
        let cpath = CString::new(path)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FdDriver { fd, owned: true })
    }

    /// Wraps an existing descriptor.
    ///
    /// # Safety
    ///
    /// With `owned` the driver closes `fd` at channel teardown; the
    /// caller must not close it elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd, owned: bool) -> FdDriver {
        FdDriver { fd, owned }
    }
}

impl Driver for FdDriver {
    fn kind(&self) -> &'static str {
        "fd"
    }

    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, dst.as_mut_ptr().cast(), dst.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn output(&mut self, src: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, src.as_ptr().cast(), src.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.owned && self.fd >= 0 {
            let ret = unsafe { libc::close(self.fd) };
            self.fd = -1;
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(off) => (off as i64, libc::SEEK_SET),
            SeekFrom::Current(off) => (off, libc::SEEK_CUR),
            SeekFrom::End(off) => (off, libc::SEEK_END),
        };
        let newpos = unsafe { libc::lseek(self.fd, offset, whence) };
        if newpos < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(newpos as u64)
    }

    fn is_seekable(&self) -> bool {
        unsafe { libc::lseek(self.fd, 0, libc::SEEK_CUR) != -1 }
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if blocking {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn watch(&mut self, interest: Ready) {
        // Real readiness integration goes through handle(); an embedding
        // event loop polls the fd for this mask.
        trace!("fd {} interest {:?}", self.fd, interest);
    }

    fn handle(&self, _dir: Direction) -> Option<RawFd> {
        if self.fd >= 0 {
            Some(self.fd)
        } else {
            None
        }
    }
}

impl Drop for FdDriver {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
