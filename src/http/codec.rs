//! URL and base64 codecs.
//!
//! These helpers write into caller-provided buffers and never allocate,
//! so the output capacity is part of the contract: running out of room is
//! reported instead of truncating silently.

use thiserror::Error;

/// Error returned by the percent codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The output buffer cannot hold the result.
    #[error("output buffer too small")]
    Overflow,
    /// A `%` was not followed by two hex digits.
    #[error("malformed percent escape")]
    Malformed,
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

/// Decode `%XX` escapes from `src` into `dst` in a single pass.
///
/// Returns the number of bytes written.
pub fn percent_decode(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    let mut len = 0;
    let mut i = 0;

    while i < src.len() {
        let (byte, consumed) = if src[i] == b'%' {
            let hi = src.get(i + 1).copied().and_then(hex_value);
            let lo = src.get(i + 2).copied().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => ((hi << 4) | lo, 3),
                _ => return Err(CodecError::Malformed),
            }
        } else {
            (src[i], 1)
        };

        let slot = dst.get_mut(len).ok_or(CodecError::Overflow)?;
        *slot = byte;
        len += 1;
        i += consumed;
    }

    Ok(len)
}

/// Encode `src` into `dst`, escaping everything except `[A-Za-z0-9-_.~]`.
///
/// Returns the number of bytes written.
pub fn percent_encode(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    let mut len = 0;

    for &b in src {
        if is_unreserved(b) {
            let slot = dst.get_mut(len).ok_or(CodecError::Overflow)?;
            *slot = b;
            len += 1;
        } else {
            let out = dst.get_mut(len..len + 3).ok_or(CodecError::Overflow)?;
            out[0] = b'%';
            out[1] = HEX_DIGITS[usize::from(b >> 4)];
            out[2] = HEX_DIGITS[usize::from(b & 0x0f)];
            len += 3;
        }
    }

    Ok(len)
}

fn base64_value(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'a'..=b'z' => Some(c - b'a' + 26),
        b'0'..=b'9' => Some(c - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Tolerant base64 decoder.
///
/// Bytes outside the alphabet are skipped (line breaks, spaces, stray
/// punctuation). Decoding stops at the first quantum that would not fit
/// in `dst`; the return value is the number of bytes written.
pub fn base64_decode(src: &[u8], dst: &mut [u8]) -> usize {
    let mut acc: u32 = 0;
    let mut symbols = 0;
    let mut padding = 0;
    let mut len = 0;

    for &c in src {
        let value = if c == b'=' {
            padding += 1;
            0
        } else {
            match base64_value(c) {
                Some(v) => v,
                None => continue,
            }
        };

        acc = (acc << 6) | u32::from(value);
        symbols += 1;

        if symbols == 4 {
            let bytes = [(acc >> 16) as u8, (acc >> 8) as u8, acc as u8];
            let take = 3 - padding.min(2);
            let Some(out) = dst.get_mut(len..len + take) else {
                return len;
            };
            out.copy_from_slice(&bytes[..take]);
            len += take;

            if padding > 0 {
                return len;
            }
            acc = 0;
            symbols = 0;
        }
    }

    // Unpadded tail.
    let tail: &[u8] = match symbols {
        2 => &[(acc >> 4) as u8],
        3 => &[(acc >> 10) as u8, (acc >> 2) as u8],
        _ => &[],
    };
    if let Some(out) = dst.get_mut(len..len + tail.len()) {
        out.copy_from_slice(tail);
        len += tail.len();
    }

    len
}
