//! Character-set conversion between a channel's external byte
//! representation and the internal UTF-8 text representation.
//!
//! `Binary` is the absence of an encoding: bytes pass through unchanged.
//! Conversion is incremental: a multi-byte sequence split at a buffer
//! boundary is completed on the next call. On the read side the undecoded
//! tail bytes are physically carried into the front padding of the next
//! buffer by the caller (see [`crate::buffer`]); on the write side the
//! encoder itself carries the partial character, because the staging
//! chunks handed to it are cut at arbitrary byte positions.
//!
//! Invalid input decodes to U+FFFD and unrepresentable output encodes to
//! `?`; conversion never fails.

/// External text encoding of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextEncoding {
    /// No encoding: raw byte passthrough.
    Binary,
    /// UTF-8 external data.
    Utf8,
    /// ISO 8859-1 external data.
    Latin1,
}

impl TextEncoding {
    /// Parses an option value (`binary`, `utf-8`, `iso8859-1`).
    pub fn from_name(name: &str) -> Option<TextEncoding> {
        match name {
            "binary" => Some(TextEncoding::Binary),
            "utf-8" => Some(TextEncoding::Utf8),
            "iso8859-1" => Some(TextEncoding::Latin1),
            _ => None,
        }
    }

    /// The option-value spelling of this encoding.
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Binary => "binary",
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "iso8859-1",
        }
    }
}

/// Incremental state of the read-direction conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DecodeState {
    /// True until the first conversion call of a logical stream; reset on
    /// reconfiguration so stateful encodings could resynchronize.
    pub start: bool,
}

impl Default for DecodeState {
    fn default() -> Self {
        DecodeState { start: true }
    }
}

/// Incremental state of the write-direction conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EncodeState {
    pub start: bool,
    /// Bytes of a partial UTF-8 character cut off at the end of the
    /// previous staging chunk.
    pending: [u8; 4],
    pending_len: u8,
}

impl Default for EncodeState {
    fn default() -> Self {
        EncodeState {
            start: true,
            pending: [0; 4],
            pending_len: 0,
        }
    }
}

/// Outcome of one decode call.
pub(crate) struct DecodeResult {
    /// Raw external bytes consumed.
    pub consumed: usize,
    /// Internal UTF-8 bytes produced.
    pub produced: usize,
    /// Characters produced.
    pub chars: usize,
    /// The span ended in an incomplete multi-byte sequence; the caller
    /// must supply the tail together with more raw bytes.
    pub needs_more: bool,
}

const REPLACEMENT: &[u8] = "\u{FFFD}".as_bytes();

fn utf8_seq_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

/// Copies whole characters from `s` into `dst`, bounded by destination
/// space and a character budget.
fn copy_chars(s: &str, dst: &mut [u8], max_chars: usize) -> (usize, usize) {
    let mut bytes = 0;
    let mut chars = 0;
    for ch in s.chars() {
        let l = ch.len_utf8();
        if chars == max_chars || bytes + l > dst.len() {
            break;
        }
        bytes += l;
        chars += 1;
    }
    dst[..bytes].copy_from_slice(&s.as_bytes()[..bytes]);
    (bytes, chars)
}

/// Converts external bytes to internal UTF-8.
///
/// Stops at the destination boundary, at the character budget, or at an
/// incomplete trailing sequence. With `end_of_stream` a dangling tail is
/// replaced instead of deferred.
pub(crate) fn decode(
    encoding: TextEncoding,
    state: &mut DecodeState,
    src: &[u8],
    dst: &mut [u8],
    max_chars: usize,
    end_of_stream: bool,
) -> DecodeResult {
    state.start = false;
    let mut si = 0;
    let mut di = 0;
    let mut chars = 0;
    let mut needs_more = false;

    match encoding {
        TextEncoding::Binary => {
            let n = src.len().min(dst.len()).min(max_chars);
            dst[..n].copy_from_slice(&src[..n]);
            si = n;
            di = n;
            chars = n;
        }
        TextEncoding::Latin1 => {
            while si < src.len() && chars < max_chars {
                let ch = src[si] as char;
                let l = ch.len_utf8();
                if di + l > dst.len() {
                    break;
                }
                ch.encode_utf8(&mut dst[di..di + l]);
                si += 1;
                di += l;
                chars += 1;
            }
        }
        TextEncoding::Utf8 => {
            while si < src.len() && chars < max_chars && di < dst.len() {
                match std::str::from_utf8(&src[si..]) {
                    Ok(s) => {
                        let (nb, nc) = copy_chars(s, &mut dst[di..], max_chars - chars);
                        si += nb;
                        di += nb;
                        chars += nc;
                        break;
                    }
                    Err(e) => {
                        let valid = e.valid_up_to();
                        if valid > 0 {
                            let prefix = std::str::from_utf8(&src[si..si + valid])
                                .unwrap_or_default();
                            let (nb, nc) = copy_chars(prefix, &mut dst[di..], max_chars - chars);
                            si += nb;
                            di += nb;
                            chars += nc;
                            if nb < valid {
                                break;
                            }
                            continue;
                        }
                        match e.error_len() {
                            Some(bad) => {
                                if di + REPLACEMENT.len() > dst.len() {
                                    break;
                                }
                                dst[di..di + REPLACEMENT.len()].copy_from_slice(REPLACEMENT);
                                di += REPLACEMENT.len();
                                chars += 1;
                                si += bad;
                            }
                            None => {
                                if end_of_stream {
                                    if di + REPLACEMENT.len() <= dst.len() {
                                        dst[di..di + REPLACEMENT.len()]
                                            .copy_from_slice(REPLACEMENT);
                                        di += REPLACEMENT.len();
                                        chars += 1;
                                        si = src.len();
                                    }
                                } else {
                                    needs_more = true;
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    DecodeResult {
        consumed: si,
        produced: di,
        chars,
        needs_more,
    }
}

/// Outcome of one encode call.
pub(crate) struct EncodeResult {
    /// Internal UTF-8 bytes consumed (a partial trailing character counts
    /// as consumed; it is carried in the state).
    pub consumed: usize,
    /// External bytes produced.
    pub produced: usize,
}

fn latin1_byte(seq: &[u8]) -> u8 {
    match std::str::from_utf8(seq).ok().and_then(|s| s.chars().next()) {
        Some(c) if (c as u32) <= 0xFF => c as u32 as u8,
        _ => b'?',
    }
}

/// Converts internal UTF-8 to external bytes.
pub(crate) fn encode(
    encoding: TextEncoding,
    state: &mut EncodeState,
    src: &[u8],
    dst: &mut [u8],
) -> EncodeResult {
    state.start = false;
    match encoding {
        TextEncoding::Binary | TextEncoding::Utf8 => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            EncodeResult {
                consumed: n,
                produced: n,
            }
        }
        TextEncoding::Latin1 => {
            let mut si = 0;
            let mut di = 0;

            if state.pending_len > 0 {
                let need = utf8_seq_len(state.pending[0]);
                while (state.pending_len as usize) < need && si < src.len() {
                    state.pending[state.pending_len as usize] = src[si];
                    state.pending_len += 1;
                    si += 1;
                }
                if (state.pending_len as usize) < need {
                    return EncodeResult {
                        consumed: si,
                        produced: 0,
                    };
                }
                if dst.is_empty() {
                    // Completed character stays pending until there is room.
                    return EncodeResult {
                        consumed: si,
                        produced: 0,
                    };
                }
                dst[di] = latin1_byte(&state.pending[..need]);
                di += 1;
                state.pending_len = 0;
            }

            while si < src.len() && di < dst.len() {
                let l = utf8_seq_len(src[si]);
                if si + l > src.len() {
                    let rest = src.len() - si;
                    state.pending[..rest].copy_from_slice(&src[si..]);
                    state.pending_len = rest as u8;
                    si = src.len();
                    break;
                }
                dst[di] = latin1_byte(&src[si..si + l]);
                di += 1;
                si += l;
            }

            EncodeResult {
                consumed: si,
                produced: di,
            }
        }
    }
}
