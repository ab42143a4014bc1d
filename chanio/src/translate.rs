//! End-of-line translation between a channel's wire convention and the
//! single logical `\n` used internally.
//!
//! Both directions operate incrementally: a CRLF pair or a lone CR may be
//! split across two buffers (or two calls), so each direction carries a
//! small amount of state between calls. On output, a CRLF pair that would
//! overflow the destination by one byte commits the `\r` and owes the `\n`
//! to the start of the next buffer. On input, AUTO mode remembers that the
//! previous span ended in `\r` so a following `\n` is collapsed, and CRLF
//! mode holds back a trailing `\r` until the next byte shows whether it is
//! half of a pair.

/// End-of-line convention of one channel direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Translation {
    /// Recognize any of `\r`, `\n`, or `\r\n` on input; platform
    /// convention on output.
    Auto,
    /// `\n` only.
    Lf,
    /// `\r` only.
    Cr,
    /// The two-byte `\r\n` sequence.
    CrLf,
}

impl Translation {
    /// The convention native to the compilation target.
    pub fn platform() -> Translation {
        if cfg!(windows) {
            Translation::CrLf
        } else {
            Translation::Lf
        }
    }

    /// Resolves `Auto` for the write direction, where it means the
    /// platform convention.
    pub(crate) fn effective_output(self) -> Translation {
        match self {
            Translation::Auto => Translation::platform(),
            other => other,
        }
    }

    /// Parses an option value (`auto`, `lf`, `cr`, `crlf`, `platform`).
    pub fn from_name(name: &str) -> Option<Translation> {
        match name {
            "auto" => Some(Translation::Auto),
            "lf" => Some(Translation::Lf),
            "cr" => Some(Translation::Cr),
            "crlf" => Some(Translation::CrLf),
            "platform" => Some(Translation::platform()),
            _ => None,
        }
    }

    /// The option-value spelling of this convention.
    pub fn name(self) -> &'static str {
        match self {
            Translation::Auto => "auto",
            Translation::Lf => "lf",
            Translation::Cr => "cr",
            Translation::CrLf => "crlf",
        }
    }
}

/// Read-direction carry state.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub(crate) struct InputEolState {
    /// AUTO: the last byte of the previous span was `\r`; a `\n` at the
    /// start of the next span belongs to it and is swallowed.
    pub cr_seen: bool,
    /// CRLF: a trailing `\r` is being held back until the following byte
    /// shows whether it completes a pair.
    pub need_lf: bool,
}

/// Write-direction carry state.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub(crate) struct OutputEolState {
    /// A CRLF pair was split at a buffer boundary; the `\n` half is owed
    /// at the very start of the next buffer.
    pub owe_lf: bool,
}

/// Outcome of one output-translation call.
pub(crate) struct OutputResult {
    pub consumed: usize,
    pub produced: usize,
    /// Whether any newline was produced, for line-buffered flushing.
    pub newline: bool,
}

/// Copies logical bytes into a physical output buffer, mapping `\n`
/// according to `mode`. `mode` must already be resolved for output
/// (never `Auto`).
pub(crate) fn translate_output_eol(
    mode: Translation,
    state: &mut OutputEolState,
    src: &[u8],
    dst: &mut [u8],
) -> OutputResult {
    let mode = mode.effective_output();
    let mut si = 0;
    let mut di = 0;
    let mut newline = false;

    if state.owe_lf {
        if dst.is_empty() {
            return OutputResult {
                consumed: 0,
                produced: 0,
                newline: false,
            };
        }
        dst[di] = b'\n';
        di += 1;
        state.owe_lf = false;
        newline = true;
    }

    while si < src.len() && di < dst.len() {
        let b = src[si];
        if b != b'\n' {
            dst[di] = b;
            si += 1;
            di += 1;
            continue;
        }
        newline = true;
        match mode {
            Translation::Lf => {
                dst[di] = b'\n';
                si += 1;
                di += 1;
            }
            Translation::Cr => {
                dst[di] = b'\r';
                si += 1;
                di += 1;
            }
            Translation::CrLf => {
                if dst.len() - di >= 2 {
                    dst[di] = b'\r';
                    dst[di + 1] = b'\n';
                    si += 1;
                    di += 2;
                } else {
                    // Exactly one byte left: commit the CR, owe the LF.
                    dst[di] = b'\r';
                    si += 1;
                    di += 1;
                    state.owe_lf = true;
                    break;
                }
            }
            Translation::Auto => unreachable!("output mode resolved above"),
        }
    }

    OutputResult {
        consumed: si,
        produced: di,
        newline,
    }
}

/// Outcome of one input-translation call.
pub(crate) struct InputResult {
    pub consumed: usize,
    pub produced: usize,
    /// A genuine line terminator was translated and, because
    /// `stop_at_terminator` was set, processing stopped right after its
    /// `\n` image (always the last produced byte when set).
    pub terminated: bool,
}

/// Rewrites raw input bytes into the internal representation where every
/// line terminator is a single `\n`.
///
/// Not every produced `\n` is a terminator: in CR and CRLF modes a raw
/// lone `\n` is ordinary data and passes through. With
/// `stop_at_terminator` the call returns as soon as a real terminator has
/// been emitted, which is what the line-read path needs to avoid consuming
/// past the end of a line.
pub(crate) fn translate_input_eol(
    mode: Translation,
    state: &mut InputEolState,
    src: &[u8],
    dst: &mut [u8],
    stop_at_terminator: bool,
) -> InputResult {
    let mut si = 0;
    let mut di = 0;
    let mut terminated = false;

    while si < src.len() && di < dst.len() {
        let b = src[si];
        match mode {
            Translation::Lf => {
                dst[di] = b;
                si += 1;
                di += 1;
                if b == b'\n' {
                    terminated = true;
                }
            }
            Translation::Cr => {
                if b == b'\r' {
                    dst[di] = b'\n';
                    terminated = true;
                } else {
                    dst[di] = b;
                }
                si += 1;
                di += 1;
            }
            Translation::CrLf => {
                if state.need_lf {
                    state.need_lf = false;
                    if b == b'\n' {
                        dst[di] = b'\n';
                        si += 1;
                        di += 1;
                        terminated = true;
                    } else {
                        // The held-back CR was not part of a pair.
                        dst[di] = b'\r';
                        di += 1;
                    }
                } else if b == b'\r' {
                    state.need_lf = true;
                    si += 1;
                } else {
                    dst[di] = b;
                    si += 1;
                    di += 1;
                }
            }
            Translation::Auto => {
                if b == b'\n' {
                    if state.cr_seen {
                        // Second half of a CRLF pair; the CR already
                        // produced the newline.
                        si += 1;
                        state.cr_seen = false;
                    } else {
                        dst[di] = b'\n';
                        si += 1;
                        di += 1;
                        terminated = true;
                    }
                } else if b == b'\r' {
                    dst[di] = b'\n';
                    si += 1;
                    di += 1;
                    state.cr_seen = true;
                    terminated = true;
                } else {
                    dst[di] = b;
                    si += 1;
                    di += 1;
                    state.cr_seen = false;
                }
            }
        }
        if terminated {
            if stop_at_terminator {
                break;
            }
            terminated = false;
        }
    }

    InputResult {
        consumed: si,
        produced: di,
        terminated: terminated && stop_at_terminator,
    }
}

/// Emits any byte still held back by the input carry state, at end of
/// stream. Returns the number of bytes written into `dst` (0 or 1).
pub(crate) fn flush_input_eol(state: &mut InputEolState, dst: &mut [u8]) -> usize {
    if state.need_lf && !dst.is_empty() {
        state.need_lf = false;
        dst[0] = b'\r';
        1
    } else {
        0
    }
}

/// Finds the configured in-stream EOF byte in a raw span.
///
/// Returns how many bytes may be processed and whether the EOF byte was
/// found at that limit. The EOF byte itself is never consumed or
/// delivered.
pub(crate) fn scan_eof_char(src: &[u8], eof_char: Option<u8>) -> (usize, bool) {
    match eof_char {
        None => (src.len(), false),
        Some(c) => match src.iter().position(|&b| b == c) {
            Some(i) => (i, true),
            None => (src.len(), false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(mode: Translation, state: &mut OutputEolState, src: &[u8], cap: usize) -> (Vec<u8>, usize, bool) {
        let mut dst = vec![0u8; cap];
        let r = translate_output_eol(mode, state, src, &mut dst);
        dst.truncate(r.produced);
        (dst, r.consumed, r.newline)
    }

    #[test]
    fn output_lf_cr_crlf() {
        let mut st = OutputEolState::default();
        assert_eq!(out(Translation::Lf, &mut st, b"a\nb", 8).0, b"a\nb");
        assert_eq!(out(Translation::Cr, &mut st, b"a\nb", 8).0, b"a\rb");
        assert_eq!(out(Translation::CrLf, &mut st, b"a\nb", 8).0, b"a\r\nb");
    }

    #[test]
    fn output_crlf_split_at_boundary_owes_lf() {
        let mut st = OutputEolState::default();
        // Two bytes of room: 'a' plus the CR half of the pair.
        let (bytes, consumed, newline) = out(Translation::CrLf, &mut st, b"a\nb", 2);
        assert_eq!(bytes, b"a\r");
        assert_eq!(consumed, 2);
        assert!(newline);
        assert!(st.owe_lf);

        // The owed LF comes first in the next buffer, nothing dropped or
        // duplicated.
        let (bytes, consumed, _) = out(Translation::CrLf, &mut st, b"b", 8);
        assert_eq!(bytes, b"\nb");
        assert_eq!(consumed, 1);
        assert!(!st.owe_lf);
    }

    fn input(
        mode: Translation,
        state: &mut InputEolState,
        src: &[u8],
        stop: bool,
    ) -> (Vec<u8>, usize, bool) {
        let mut dst = vec![0u8; src.len() + 1];
        let r = translate_input_eol(mode, state, src, &mut dst, stop);
        dst.truncate(r.produced);
        (dst, r.consumed, r.terminated)
    }

    #[test]
    fn input_modes_basic() {
        let mut st = InputEolState::default();
        assert_eq!(input(Translation::Lf, &mut st, b"a\nb", false).0, b"a\nb");
        assert_eq!(input(Translation::Cr, &mut st, b"a\rb", false).0, b"a\nb");
        assert_eq!(input(Translation::CrLf, &mut st, b"a\r\nb", false).0, b"a\nb");
        assert_eq!(input(Translation::Auto, &mut st, b"a\r\nb\rc\nd", false).0, b"a\nb\nc\nd");
    }

    #[test]
    fn input_auto_cr_at_boundary_swallows_following_lf() {
        let mut st = InputEolState::default();
        let (bytes, consumed, _) = input(Translation::Auto, &mut st, b"ab\r", false);
        assert_eq!(bytes, b"ab\n");
        assert_eq!(consumed, 3);
        assert!(st.cr_seen);

        let (bytes, consumed, _) = input(Translation::Auto, &mut st, b"\ncd", false);
        assert_eq!(bytes, b"cd");
        assert_eq!(consumed, 3);
        assert!(!st.cr_seen);
    }

    #[test]
    fn input_crlf_holds_trailing_cr() {
        let mut st = InputEolState::default();
        let (bytes, consumed, _) = input(Translation::CrLf, &mut st, b"ab\r", false);
        assert_eq!(bytes, b"ab");
        assert_eq!(consumed, 3);
        assert!(st.need_lf);

        // Completed by the next span.
        let (bytes, _, _) = input(Translation::CrLf, &mut st, b"\ncd", false);
        assert_eq!(bytes, b"\ncd");
        assert!(!st.need_lf);
    }

    #[test]
    fn input_crlf_lone_cr_is_data() {
        let mut st = InputEolState::default();
        let (bytes, _, _) = input(Translation::CrLf, &mut st, b"ab\rcd", false);
        assert_eq!(bytes, b"ab\rcd");
    }

    #[test]
    fn input_crlf_cr_at_end_of_stream_flushes_as_data() {
        let mut st = InputEolState::default();
        let (bytes, _, _) = input(Translation::CrLf, &mut st, b"ab\r", false);
        assert_eq!(bytes, b"ab");
        let mut tail = [0u8; 4];
        let n = flush_input_eol(&mut st, &mut tail);
        assert_eq!(&tail[..n], b"\r");
        assert!(!st.need_lf);
    }

    #[test]
    fn stop_at_terminator_only_stops_on_real_terminators() {
        // In CR mode a raw \n is data, not a terminator.
        let mut st = InputEolState::default();
        let (bytes, consumed, terminated) =
            input(Translation::Cr, &mut st, b"a\nb\rrest", true);
        assert_eq!(bytes, b"a\nb\n");
        assert_eq!(consumed, 4);
        assert!(terminated);

        // In LF mode \r is data.
        let mut st = InputEolState::default();
        let (bytes, _, terminated) = input(Translation::Lf, &mut st, b"a\rb\nrest", true);
        assert_eq!(bytes, b"a\rb\n");
        assert!(terminated);
    }

    #[test]
    fn crlf_crcr_lf_sequence() {
        let mut st = InputEolState::default();
        let (bytes, _, _) = input(Translation::CrLf, &mut st, b"\r\r\n", false);
        assert_eq!(bytes, b"\r\n");
    }

    #[test]
    fn eof_char_scanning() {
        assert_eq!(scan_eof_char(b"data", None), (4, false));
        assert_eq!(scan_eof_char(b"da\x1Ata", Some(0x1A)), (2, true));
        assert_eq!(scan_eof_char(b"data", Some(0x1A)), (4, false));
        assert_eq!(scan_eof_char(b"\x1A", Some(0x1A)), (0, true));
    }

    #[test]
    fn roundtrip_all_modes() {
        for mode in [Translation::Lf, Translation::Cr, Translation::CrLf] {
            let logical = b"one\ntwo\nthree\n";
            let mut ost = OutputEolState::default();
            let mut wire = vec![0u8; 64];
            let w = translate_output_eol(mode, &mut ost, logical, &mut wire);
            assert_eq!(w.consumed, logical.len());
            wire.truncate(w.produced);

            let mut ist = InputEolState::default();
            let mut back = vec![0u8; 64];
            let r = translate_input_eol(mode, &mut ist, &wire, &mut back, false);
            assert_eq!(r.consumed, wire.len());
            back.truncate(r.produced);
            assert_eq!(back, logical);
        }
    }
}
