//! LEB128 variable-length unsigned integers.
//!
//! Each byte carries 7 payload bits, least significant group first; the high
//! bit marks a continuation. A `u64` takes at most [`MAX_VARINT_LEN`] bytes.

use crate::error::{DenError, Result};

/// Maximum encoded length of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf`, returning the number of bytes written.
pub fn write_u64(buf: &mut Vec<u8>, mut value: u64) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Decodes a value from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns `DenError::Corrupt` if the input ends mid-value or the value does
/// not fit in 64 bits.
pub fn read_u64(input: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in input.iter().enumerate() {
        let payload = (byte & 0x7F) as u64;
        if shift == 63 && payload > 1 {
            return Err(DenError::Corrupt("varint overflows u64".into()));
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(DenError::Corrupt("varint longer than 10 bytes".into()));
        }
    }
    Err(DenError::Corrupt("truncated varint".into()))
}

/// Returns the encoded length of `value` without writing it.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
