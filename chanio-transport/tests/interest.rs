//! Interest computation and the buffered-data timer fallback.

use std::cell::Cell;
use std::rc::Rc;

use chanio::{Channel, IoContext, Ready};
use chanio_transport::memory::memory_duplex;

#[test]
fn buffered_input_suppresses_read_interest_and_arms_timer() {
    let ctx = IoContext::new();
    let (drv, peer) = memory_duplex();
    let chan = ctx.open("i", Box::new(drv), Ready::READABLE).unwrap();
    chan.set_blocking(false).unwrap();

    let hits = Rc::new(Cell::new(0u32));
    let hits_tx = Rc::clone(&hits);
    chan.add_handler(Ready::READABLE, move |_| {
        hits_tx.set(hits_tx.get() + 1);
    });
    // Nothing buffered: the driver is watched for readability.
    assert!(peer.watched().is_readable());

    // A line read leaves "def" buffered; interest flips to the timer.
    peer.send(b"abc\ndef");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("abc"));
    assert!(!peer.watched().is_readable());
    assert!(ctx.has_pending_timers());

    // The timer delivers the readiness the driver never will.
    let fired = ctx.run_ready_timers();
    assert_eq!(fired, 1);
    assert_eq!(hits.get(), 1);

    // An incomplete line read marks NEED-MORE-DATA: the suppression is
    // lifted so the loop waits on the driver instead of spinning.
    assert_eq!(chan.read_line().unwrap(), None);
    assert!(chan.is_blocked());
    assert!(peer.watched().is_readable());
}

#[test]
fn background_flush_keeps_write_interest() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("w", Box::new(drv), Ready::WRITABLE).unwrap();
    chan.set_blocking(false).unwrap();
    chan.set_binary();
    chan.set_buffering(chanio::BufferMode::None);
    peer.set_write_capacity(Some(2));

    // Five bytes into a two-byte window: the tail defers to background.
    chan.write(b"hello").unwrap();
    assert_eq!(chan.output_buffered(), 3);
    assert!(peer.watched().is_writable());

    // Drain and report writable until everything is out.
    let mut got = peer.recv_all();
    while chan.output_buffered() > 0 {
        chanio::notify_channel(&chan, Ready::WRITABLE);
        got.extend(peer.recv_all());
    }
    assert_eq!(got, b"hello");
    assert!(!peer.watched().is_writable());
}

#[test]
fn handler_can_remove_another_mid_dispatch() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("h", Box::new(drv), Ready::READABLE).unwrap();
    chan.set_blocking(false).unwrap();

    let second_ran = Rc::new(Cell::new(false));
    let second_ran_tx = Rc::clone(&second_ran);

    // The first handler removes the second before it runs.
    let chan_for_first = Rc::clone(&chan);
    let second_id = Rc::new(Cell::new(None));
    let second_id_tx = Rc::clone(&second_id);
    chan.add_handler(Ready::READABLE, move |_| {
        if let Some(id) = second_id_tx.get() {
            chan_for_first.remove_handler(id);
        }
    });
    let id = chan.add_handler(Ready::READABLE, move |_| {
        second_ran_tx.set(true);
    });
    second_id.set(Some(id));

    peer.send(b"x");
    chanio::notify_channel(&chan, Ready::READABLE);
    assert!(!second_ran.get());
}
