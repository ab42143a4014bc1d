//! Filter stacking: transparency, identity without I/O, and transforms.

use std::io;
use std::rc::Rc;

use chanio::{Channel, Driver, Ready, TextEncoding, Translation};
use chanio_transport::memory::memory_duplex;

fn rw() -> Ready {
    Ready::READABLE | Ready::WRITABLE
}

/// A filter that passes bytes through unchanged.
struct PassThrough {
    below: Rc<Channel>,
}

impl Driver for PassThrough {
    fn kind(&self) -> &'static str {
        "passthrough"
    }

    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let data = self.below.read(dst.len())?;
        if data.is_empty() {
            if self.below.is_eof() {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        dst[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn output(&mut self, src: &[u8]) -> io::Result<usize> {
        self.below.write(src)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.below.set_blocking(blocking)
    }

    fn watch(&mut self, _interest: Ready) {}
}

/// A read-side filter that uppercases ASCII.
struct Upper {
    below: Rc<Channel>,
}

impl Driver for Upper {
    fn kind(&self) -> &'static str {
        "upper"
    }

    fn input(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let data = self.below.read(dst.len())?;
        if data.is_empty() {
            if self.below.is_eof() {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        for (slot, b) in dst.iter_mut().zip(data.iter()) {
            *slot = b.to_ascii_uppercase();
        }
        Ok(data.len())
    }

    fn output(&mut self, _src: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EACCES))
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.below.set_blocking(blocking)
    }

    fn watch(&mut self, _interest: Ready) {}
}

#[test]
fn stack_unstack_is_identity_without_io() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("s", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();
    chan.set_translation(Some(Translation::CrLf), Some(Translation::CrLf));
    chan.set_eof_char(Some(0x04), None);

    // Buffer bytes without consuming them: an incomplete line read
    // pulls them in and rolls back.
    peer.send(b"buffered");
    assert_eq!(chan.read_line().unwrap(), None);
    assert_eq!(chan.input_buffered(), 8);

    let before = (
        chan.translation(),
        chan.encoding(),
        chan.eof_char(),
        chan.buffering(),
        chan.buffer_size(),
    );

    chan.stack(rw(), |below| Box::new(PassThrough { below })).unwrap();
    assert_eq!(chan.stack_depth(), 1);
    // The buffered raw bytes now belong to the covered half.
    assert_eq!(chan.input_buffered(), 0);

    chan.unstack().unwrap();
    assert_eq!(chan.stack_depth(), 0);
    assert_eq!(chan.input_buffered(), 8);
    let after = (
        chan.translation(),
        chan.encoding(),
        chan.eof_char(),
        chan.buffering(),
        chan.buffer_size(),
    );
    assert_eq!(before, after);

    // The preserved bytes still read correctly.
    peer.send(b"\r\n");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("buffered"));
}

#[test]
fn transform_filter_reads_through_and_unstacks() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("t", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    peer.send(b"hello\nworld\n");
    chan.stack(Ready::READABLE, |below| Box::new(Upper { below })).unwrap();

    assert_eq!(chan.read_line().unwrap().as_deref(), Some("HELLO"));
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("WORLD"));

    chan.unstack().unwrap();
    assert!(chan.is_writable());
    peer.send(b"again\n");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("again"));
}

#[test]
fn stacked_writes_pass_through_filter() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("wf", Box::new(drv), rw()).unwrap();
    chan.stack(rw(), |below| Box::new(PassThrough { below })).unwrap();

    chan.set_buffering(chanio::BufferMode::None);
    chan.write_text("through\n").unwrap();
    assert_eq!(peer.recv_all(), b"through\n");

    chan.unstack().unwrap();
    chan.write_text("direct\n").unwrap();
    assert_eq!(peer.recv_all(), b"direct\n");
}

#[test]
fn stack_mode_must_be_subset() {
    let (drv, _peer) = memory_duplex();
    let chan = Channel::new("ro", Box::new(drv), Ready::READABLE).unwrap();
    let err = chan
        .stack(rw(), |below| Box::new(PassThrough { below }))
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    assert_eq!(chan.stack_depth(), 0);
}

#[test]
fn binary_contract_on_covered_half() {
    let (drv, _peer) = memory_duplex();
    let chan = Channel::new("b", Box::new(drv), rw()).unwrap();
    chan.set_encoding(TextEncoding::Latin1);
    let covered = chan
        .stack(rw(), |below| Box::new(PassThrough { below }))
        .unwrap();
    // The covered half always runs raw binary; the filter keeps the
    // text configuration that was in effect.
    assert_eq!(covered.encoding(), TextEncoding::Binary);
    assert_eq!(chan.encoding(), TextEncoding::Latin1);
    chan.unstack().unwrap();
    assert_eq!(chan.encoding(), TextEncoding::Latin1);
}
