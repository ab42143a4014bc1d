//! The background copy engine: bounded transfers, chunked asynchronous
//! progress under backpressure, and the busy exclusion.

use std::cell::Cell;
use std::rc::Rc;

use chanio::{copy_channel, notify_channel, Channel, Ready};
use chanio_transport::memory::memory_duplex;

#[test]
fn bounded_sync_copy_moves_exactly_the_limit() {
    let (sdrv, speer) = memory_duplex();
    let src = Channel::new("src", Box::new(sdrv), Ready::READABLE).unwrap();
    let (ddrv, dpeer) = memory_duplex();
    let dst = Channel::new("dst", Box::new(ddrv), Ready::WRITABLE).unwrap();
    src.set_binary();
    dst.set_binary();

    speer.send(b"0123456789");
    speer.close();

    let total = copy_channel(&src, &dst, Some(4), None).unwrap();
    assert_eq!(total, Some(4));
    assert_eq!(dpeer.recv_all(), b"0123");
    // The rest stays buffered on the source, unconsumed by the copy.
    assert_eq!(src.input_buffered(), 6);
    // Modes were restored.
    assert!(!src.is_nonblocking());
    assert!(!dst.is_nonblocking());
}

#[test]
fn sync_copy_to_eof() {
    let (sdrv, speer) = memory_duplex();
    let src = Channel::new("src", Box::new(sdrv), Ready::READABLE).unwrap();
    let (ddrv, dpeer) = memory_duplex();
    let dst = Channel::new("dst", Box::new(ddrv), Ready::WRITABLE).unwrap();
    src.set_binary();
    dst.set_binary();

    speer.send(b"all of it");
    speer.close();

    let total = copy_channel(&src, &dst, None, None).unwrap();
    assert_eq!(total, Some(9));
    assert_eq!(dpeer.recv_all(), b"all of it");
}

#[test]
fn async_copy_progresses_across_notifier_wakeups() {
    let (sdrv, speer) = memory_duplex();
    let src = Channel::new("src", Box::new(sdrv), Ready::READABLE).unwrap();
    let (ddrv, dpeer) = memory_duplex();
    let dst = Channel::new("dst", Box::new(ddrv), Ready::WRITABLE).unwrap();
    src.set_binary();
    dst.set_binary();
    dpeer.set_write_capacity(Some(4));

    let done: Rc<Cell<Option<(u64, bool)>>> = Rc::new(Cell::new(None));
    let done_tx = Rc::clone(&done);
    let started = copy_channel(
        &src,
        &dst,
        Some(10),
        Some(Box::new(move |total, err| {
            done_tx.set(Some((total, err.is_none())));
        })),
    )
    .unwrap();
    assert_eq!(started, None);

    // Nothing staged yet: the copy parked itself on a read handler.
    assert!(done.get().is_none());

    let mut moved = Vec::new();

    // First burst: six bytes in, only four fit the destination.
    speer.send(b"abcdef");
    notify_channel(&src, Ready::READABLE);
    assert!(done.get().is_none());
    assert_eq!(dpeer.pending(), 4);
    moved.extend(dpeer.recv_all());

    // The first writable wakeup is consumed by the background flush (the
    // write bit is cleared before dispatch); the next one reaches the
    // copy's handler, which parks on the dry source again.
    notify_channel(&dst, Ready::WRITABLE);
    notify_channel(&dst, Ready::WRITABLE);
    moved.extend(dpeer.recv_all());
    assert!(done.get().is_none());

    // Second burst finishes the ten-byte budget.
    speer.send(b"ghijKLMN");
    notify_channel(&src, Ready::READABLE);
    moved.extend(dpeer.recv_all());

    assert_eq!(done.get(), Some((10, true)));
    assert_eq!(moved, b"abcdefghij");
    // Modes and buffering were restored on completion.
    assert!(!src.is_nonblocking());
    assert!(!dst.is_nonblocking());
    assert_eq!(dst.buffering(), chanio::BufferMode::Full);
}

#[test]
fn copy_owns_both_channels() {
    let (sdrv, _speer) = memory_duplex();
    let src = Channel::new("src", Box::new(sdrv), Ready::READABLE).unwrap();
    let (ddrv, _dpeer) = memory_duplex();
    let dst = Channel::new("dst", Box::new(ddrv), Ready::WRITABLE).unwrap();
    src.set_binary();
    dst.set_binary();

    // Source is empty, so the async copy parks immediately.
    let started = copy_channel(&src, &dst, None, Some(Box::new(|_, _| {}))).unwrap();
    assert_eq!(started, None);

    let err = src.read(4).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    let err = dst.write(b"x").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

    let (odrv, _opeer) = memory_duplex();
    let other = Channel::new("other", Box::new(odrv), Ready::WRITABLE).unwrap();
    let err = copy_channel(&src, &other, None, None).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
}
