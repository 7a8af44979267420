//! The composite point key.

use std::cmp::Ordering;
use std::fmt;

use crate::codec::varint;
use crate::error::{DenError, Result};

/// Size of the fixed key form in bytes.
pub const KEY_SIZE: usize = 24;

/// Composite key ordering records by timestamp, point id, then entry number.
///
/// The fixed form is three consecutive little-endian `u64` fields. Inside an
/// encoded node each field is stored as `varint(previous ^ current)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PointKey {
    /// Ticks (100 ns) since 0001-01-01.
    pub timestamp: u64,
    /// Measurement identifier.
    pub point_id: u64,
    /// Disambiguates duplicate timestamps for one point.
    pub entry_number: u64,
}

impl PointKey {
    /// The smallest key (all fields zero).
    pub const MIN: PointKey = PointKey {
        timestamp: 0,
        point_id: 0,
        entry_number: 0,
    };

    /// The largest key (all fields `u64::MAX`).
    pub const MAX: PointKey = PointKey {
        timestamp: u64::MAX,
        point_id: u64::MAX,
        entry_number: u64::MAX,
    };

    /// Creates a key from its three fields.
    pub const fn new(timestamp: u64, point_id: u64, entry_number: u64) -> Self {
        Self {
            timestamp,
            point_id,
            entry_number,
        }
    }

    /// Total order: timestamp, then point id, then entry number.
    pub fn compare(&self, other: &PointKey) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.point_id.cmp(&other.point_id))
            .then(self.entry_number.cmp(&other.entry_number))
    }

    /// Sets every field to its minimum.
    pub fn set_min(&mut self) {
        *self = Self::MIN;
    }

    /// Sets every field to its maximum.
    pub fn set_max(&mut self) {
        *self = Self::MAX;
    }

    /// Zeroes every field.
    pub fn clear(&mut self) {
        self.timestamp = 0;
        self.point_id = 0;
        self.entry_number = 0;
    }

    /// Copies all fields from `source`.
    pub fn copy_from(&mut self, source: &PointKey) {
        self.timestamp = source.timestamp;
        self.point_id = source.point_id;
        self.entry_number = source.entry_number;
    }

    /// Writes the 24-byte fixed form to the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::OutOfRange` if `buf` is shorter than [`KEY_SIZE`].
    pub fn write_fixed(&self, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.point_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_number.to_le_bytes());
        Ok(())
    }

    /// Reads the 24-byte fixed form from the front of `buf` into `self`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::OutOfRange` if `buf` is shorter than [`KEY_SIZE`].
    pub fn read_fixed(&mut self, buf: &[u8]) -> Result<()> {
        check_len(buf.len())?;
        self.timestamp = read_le(&buf[0..8]);
        self.point_id = read_le(&buf[8..16]);
        self.entry_number = read_le(&buf[16..24]);
        Ok(())
    }

    /// Decodes a key from its fixed form.
    pub fn from_fixed(buf: &[u8]) -> Result<Self> {
        let mut key = Self::MIN;
        key.read_fixed(buf)?;
        Ok(key)
    }

    /// Returns the fixed form as an array.
    pub fn to_fixed(&self) -> [u8; KEY_SIZE] {
        let mut buf = [0u8; KEY_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.point_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_number.to_le_bytes());
        buf
    }

    /// Appends the delta form of `self` against `previous` to `out`.
    ///
    /// Returns the number of bytes written.
    pub fn write_delta(&self, out: &mut Vec<u8>, previous: &PointKey) -> usize {
        varint::write_u64(out, previous.timestamp ^ self.timestamp)
            + varint::write_u64(out, previous.point_id ^ self.point_id)
            + varint::write_u64(out, previous.entry_number ^ self.entry_number)
    }

    /// Decodes the delta form at the front of `input` into `self`, using
    /// `previous` as the baseline.
    ///
    /// Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupt` if any field is truncated or malformed.
    pub fn read_delta(&mut self, input: &[u8], previous: &PointKey) -> Result<usize> {
        let (timestamp, a) = varint::read_u64(input)?;
        let (point_id, b) = varint::read_u64(&input[a..])?;
        let (entry_number, c) = varint::read_u64(&input[a + b..])?;
        self.timestamp = timestamp ^ previous.timestamp;
        self.point_id = point_id ^ previous.point_id;
        self.entry_number = entry_number ^ previous.entry_number;
        Ok(a + b + c)
    }
}

impl Ord for PointKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for PointKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.timestamp, self.point_id, self.entry_number
        )
    }
}

fn check_len(len: usize) -> Result<()> {
    if len < KEY_SIZE {
        return Err(DenError::OutOfRange {
            index: KEY_SIZE as u64 - 1,
            len: len as u64,
        });
    }
    Ok(())
}

fn read_le(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_field_priority() {
        let a = PointKey::new(1, 9, 9);
        let b = PointKey::new(2, 0, 0);
        assert_eq!(a.compare(&b), Ordering::Less);

        let c = PointKey::new(5, 1, 9);
        let d = PointKey::new(5, 2, 0);
        assert_eq!(c.compare(&d), Ordering::Less);

        let e = PointKey::new(5, 2, 1);
        let f = PointKey::new(5, 2, 3);
        assert_eq!(f.compare(&e), Ordering::Greater);
        assert_eq!(e.compare(&e), Ordering::Equal);
    }

    #[test]
    fn test_min_max_clear() {
        let mut key = PointKey::new(7, 8, 9);
        key.set_max();
        assert_eq!(key, PointKey::MAX);
        key.set_min();
        assert_eq!(key, PointKey::MIN);

        let mut other = PointKey::new(1, 2, 3);
        other.clear();
        assert_eq!(other, PointKey::MIN);
        assert!(PointKey::MIN < PointKey::MAX);
    }

    #[test]
    fn test_fixed_form_layout() {
        let key = PointKey::new(0x0102, 3, u64::MAX);
        let mut buf = [0u8; 30];
        key.write_fixed(&mut buf).unwrap();
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 0x01);
        assert_eq!(buf[8], 3);
        assert_eq!(&buf[16..24], &[0xFF; 8]);
        assert_eq!(&buf[..KEY_SIZE], &key.to_fixed());

        let mut decoded = PointKey::MIN;
        decoded.read_fixed(&buf).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_fixed_form_short_buffer() {
        let key = PointKey::new(1, 2, 3);
        let mut buf = [0u8; 23];
        assert!(matches!(
            key.write_fixed(&mut buf),
            Err(DenError::OutOfRange { len: 23, .. })
        ));
        assert!(PointKey::from_fixed(&buf).is_err());
    }

    #[test]
    fn test_delta_against_previous() {
        let previous = PointKey::new(1000, 5, 0);
        let current = PointKey::new(1001, 5, 0);
        let mut out = Vec::new();
        let written = current.write_delta(&mut out, &previous);
        // 1000 ^ 1001 = 1, point and entry unchanged
        assert_eq!(out, vec![1, 0, 0]);
        assert_eq!(written, 3);

        let mut decoded = PointKey::MIN;
        let used = decoded.read_delta(&out, &previous).unwrap();
        assert_eq!(used, 3);
        assert_eq!(decoded, current);
    }

    #[test]
    fn test_delta_truncated() {
        let mut out = Vec::new();
        PointKey::new(u64::MAX, 1, 1).write_delta(&mut out, &PointKey::MIN);
        let mut decoded = PointKey::MIN;
        assert!(decoded.read_delta(&out[..4], &PointKey::MIN).is_err());
    }

    #[test]
    fn test_copy_from() {
        let source = PointKey::new(4, 5, 6);
        let mut dest = PointKey::MAX;
        dest.copy_from(&source);
        assert_eq!(dest, source);
    }
}
