//! The transactional line read: rollback on incomplete lines, and
//! blocked-versus-EOF observability.

use chanio::{Channel, Ready};
use chanio_transport::memory::memory_duplex;

fn rw() -> Ready {
    Ready::READABLE | Ready::WRITABLE
}

#[test]
fn incomplete_line_rolls_back_and_resumes() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("m", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    peer.send(b"abc");
    assert_eq!(chan.read_line().unwrap(), None);
    assert!(chan.is_blocked());
    assert!(!chan.is_eof());
    // Nothing of the partial line was consumed.
    assert_eq!(chan.input_buffered(), 3);

    peer.send(b"def\n");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("abcdef"));
    assert_eq!(chan.input_buffered(), 0);
}

#[test]
fn rollback_is_repeatable() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("m", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    peer.send(b"partial");
    for _ in 0..3 {
        assert_eq!(chan.read_line().unwrap(), None);
        assert_eq!(chan.input_buffered(), 7);
    }
    peer.send(b"\n");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("partial"));
}

#[test]
fn blocked_and_eof_are_distinct_states() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("m", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    // Nothing staged: the read blocks.
    let bytes = chan.read(16).unwrap();
    assert!(bytes.is_empty());
    assert!(chan.is_blocked());
    assert!(!chan.is_eof());

    // Stage data and close: the read drains, the next one reports EOF.
    peer.send(b"xyz");
    peer.close();
    let bytes = chan.read(16).unwrap();
    assert_eq!(&bytes[..], b"xyz");
    let bytes = chan.read(16).unwrap();
    assert!(bytes.is_empty());
    assert!(chan.is_eof());
    assert!(!chan.is_blocked());
}

#[test]
fn terminator_bytes_are_consumed_exactly() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("m", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    // AUTO mode, CRLF terminators: both bytes of each pair go.
    peer.send(b"aa\r\nbb\r\n");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("aa"));
    assert_eq!(chan.input_buffered(), 4);
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("bb"));
    assert_eq!(chan.input_buffered(), 0);
}

#[test]
fn auto_mode_cr_terminator_split_from_its_lf() {
    let (drv, peer) = memory_duplex();
    let chan = Channel::new("m", Box::new(drv), rw()).unwrap();
    chan.set_blocking(false).unwrap();

    // The CR arrives alone; the line completes immediately.
    peer.send(b"one\r");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("one"));
    // The LF half arrives later and is swallowed, not a new terminator.
    peer.send(b"\ntwo\r");
    assert_eq!(chan.read_line().unwrap().as_deref(), Some("two"));
}
