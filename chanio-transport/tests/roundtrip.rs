//! Property tests for the end-of-line round-trip law: bytes written with
//! translation X and read back with translation X come back identical,
//! with `\n` as the one logical newline, for any chunking and any buffer
//! size.

use std::rc::Rc;

use proptest::prelude::*;

use chanio::{Channel, Ready, TextEncoding, Translation};
use chanio_transport::memory::MemoryFileDriver;

fn byte() -> impl Strategy<Value = u8> {
    // Data stays clear of raw CR so CR-based wire conventions remain
    // unambiguous, which is the premise of the round-trip law.
    prop_oneof![
        Just(b'\n'),
        Just(b'a'),
        Just(b'b'),
        Just(b'z'),
        Just(b'0'),
        Just(b' '),
    ]
}

fn mode() -> impl Strategy<Value = Translation> {
    prop_oneof![
        Just(Translation::Lf),
        Just(Translation::Cr),
        Just(Translation::CrLf),
    ]
}

proptest! {
    #[test]
    fn eol_round_trip(
        chunks in prop::collection::vec(prop::collection::vec(byte(), 0..40), 1..6),
        mode in mode(),
        buffer_size in 1usize..16,
    ) {
        let data: Vec<u8> = chunks.iter().flatten().copied().collect();

        let (drv, store) = MemoryFileDriver::new();
        let w = Channel::new("w", Box::new(drv), Ready::WRITABLE).unwrap();
        w.set_encoding(TextEncoding::Binary);
        w.set_translation(Some(mode), Some(mode));
        w.set_buffer_size(buffer_size);
        for chunk in &chunks {
            w.write(chunk).unwrap();
        }
        w.flush().unwrap();

        let r = Channel::new(
            "r",
            Box::new(MemoryFileDriver::with_store(Rc::clone(&store))),
            Ready::READABLE,
        )
        .unwrap();
        r.set_encoding(TextEncoding::Binary);
        r.set_translation(Some(mode), Some(mode));
        let back = r.read(data.len() + 16).unwrap();

        prop_assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn auto_read_accepts_any_write_convention(
        lines in prop::collection::vec(prop::collection::vec(prop_oneof![Just(b'x'), Just(b'y')], 0..10), 1..5),
        mode in mode(),
    ) {
        let (drv, store) = MemoryFileDriver::new();
        let w = Channel::new("w", Box::new(drv), Ready::WRITABLE).unwrap();
        w.set_translation(None, Some(mode));
        for line in &lines {
            w.write(line).unwrap();
            w.write(b"\n").unwrap();
        }
        w.flush().unwrap();

        let r = Channel::new(
            "r",
            Box::new(MemoryFileDriver::with_store(Rc::clone(&store))),
            Ready::READABLE,
        )
        .unwrap();
        r.set_translation(Some(Translation::Auto), None);
        for line in &lines {
            let got = r.read_line().unwrap();
            prop_assert_eq!(got.as_deref(), Some(std::str::from_utf8(line).unwrap()));
        }
        prop_assert_eq!(r.read_line().unwrap(), None);
    }
}
