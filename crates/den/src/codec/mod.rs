//! Key/value codec for point records.
//!
//! Records are `(PointKey, PointValue)` pairs. Two serialized forms exist:
//!
//! - **Fixed**: 24-byte key (three little-endian `u64`) and 8-byte value.
//! - **Delta**: each field written as `varint(previous ^ current)` in the
//!   order timestamp, point id, entry number, value. Decoding XORs against
//!   the carried-forward previous record, so a delta stream is only readable
//!   from its start.

pub mod key;
pub mod value;
pub mod varint;

pub use key::{PointKey, KEY_SIZE};
pub use value::{PointValue, VALUE_SIZE};

use crate::error::Result;

/// Appends the delta form of one record to `out`.
///
/// Returns the number of bytes written.
pub fn write_record_delta(
    out: &mut Vec<u8>,
    key: &PointKey,
    value: &PointValue,
    prev_key: &PointKey,
    prev_value: &PointValue,
) -> usize {
    key.write_delta(out, prev_key) + value.write_delta(out, prev_value)
}

/// Decodes one delta-form record from the front of `input`.
///
/// Returns the number of bytes consumed.
pub fn read_record_delta(
    input: &[u8],
    key: &mut PointKey,
    value: &mut PointValue,
    prev_key: &PointKey,
    prev_value: &PointValue,
) -> Result<usize> {
    let used = key.read_delta(input, prev_key)?;
    Ok(used + value.read_delta(&input[used..], prev_value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sequence_roundtrip() {
        let records = [
            (PointKey::new(100, 1, 0), PointValue(7)),
            (PointKey::new(100, 2, 0), PointValue(7)),
            (PointKey::new(101, 1, 0), PointValue(9)),
            (PointKey::new(u64::MAX, u64::MAX, 3), PointValue(u64::MAX)),
        ];

        let mut out = Vec::new();
        let (mut pk, mut pv) = (PointKey::MIN, PointValue::ZERO);
        for (k, v) in &records {
            write_record_delta(&mut out, k, v, &pk, &pv);
            pk = *k;
            pv = *v;
        }

        let mut offset = 0;
        let (mut pk, mut pv) = (PointKey::MIN, PointValue::ZERO);
        for (k, v) in &records {
            let (mut key, mut value) = (PointKey::MIN, PointValue::ZERO);
            offset += read_record_delta(&out[offset..], &mut key, &mut value, &pk, &pv).unwrap();
            assert_eq!((key, value), (*k, *v));
            pk = key;
            pv = value;
        }
        assert_eq!(offset, out.len());
    }
}
