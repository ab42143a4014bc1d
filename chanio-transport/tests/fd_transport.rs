//! Channels over real file descriptors: temp files and pipes.

use std::ffi::CString;

use chanio::{BufferMode, Channel, Ready, Translation};
use chanio_transport::fd::FdDriver;

fn unlink(path: &str) {
    let cpath = CString::new(path).unwrap();
    unsafe {
        libc::unlink(cpath.as_ptr());
    }
}

#[test]
fn file_write_then_read_lines() {
    let path = "/tmp/chanio_test_fd_lines.txt";

    let drv = FdDriver::open(
        path,
        libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
        0o644,
    )
    .unwrap();
    let w = Channel::new("fw", Box::new(drv), Ready::WRITABLE).unwrap();
    w.set_translation(None, Some(Translation::Lf));
    w.write_text("alpha\nbeta\n").unwrap();
    w.close().unwrap();

    let drv = FdDriver::open(path, libc::O_RDONLY, 0).unwrap();
    let r = Channel::new("fr", Box::new(drv), Ready::READABLE).unwrap();
    assert_eq!(r.read_line().unwrap().as_deref(), Some("alpha"));
    assert_eq!(r.read_line().unwrap().as_deref(), Some("beta"));
    assert_eq!(r.read_line().unwrap(), None);
    assert!(r.is_eof());
    r.close().unwrap();

    unlink(path);
}

#[test]
fn file_seek_and_tell() {
    let path = "/tmp/chanio_test_fd_seek.txt";

    let drv = FdDriver::open(
        path,
        libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
        0o644,
    )
    .unwrap();
    let chan = Channel::new("fs", Box::new(drv), Ready::READABLE | Ready::WRITABLE).unwrap();
    chan.set_binary();

    chan.write(b"0123456789").unwrap();
    chan.flush().unwrap();
    assert_eq!(chan.tell().unwrap(), 10);

    chan.seek(std::io::SeekFrom::Start(4)).unwrap();
    let bytes = chan.read(3).unwrap();
    assert_eq!(&bytes[..], b"456");
    // The raw position ran ahead of the consumer by the buffered bytes.
    assert_eq!(chan.tell().unwrap(), 7);

    chan.close().unwrap();
    unlink(path);
}

#[test]
fn pipe_nonblocking_line_read() {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let rd = unsafe { FdDriver::from_raw_fd(fds[0], true) };
    let wr = unsafe { FdDriver::from_raw_fd(fds[1], true) };

    let rchan = Channel::new("pr", Box::new(rd), Ready::READABLE).unwrap();
    let wchan = Channel::new("pw", Box::new(wr), Ready::WRITABLE).unwrap();
    rchan.set_blocking(false).unwrap();
    wchan.set_buffering(BufferMode::Line);

    wchan.write_text("partial").unwrap();
    wchan.flush().unwrap();
    assert_eq!(rchan.read_line().unwrap(), None);
    assert!(rchan.is_blocked());

    // Line buffering flushes on the newline by itself.
    wchan.write_text(" line\n").unwrap();
    assert_eq!(rchan.read_line().unwrap().as_deref(), Some("partial line"));

    rchan.close().unwrap();
    wchan.close().unwrap();
}

#[test]
fn wrong_direction_is_refused() {
    let path = "/tmp/chanio_test_fd_dir.txt";
    let drv = FdDriver::open(
        path,
        libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
        0o644,
    )
    .unwrap();
    let w = Channel::new("wo", Box::new(drv), Ready::WRITABLE).unwrap();
    let err = w.read(8).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    let err = w.read_line().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    w.close().unwrap();
    unlink(path);
}
