//! The 64-bit point value slot.

use crate::codec::varint;
use crate::error::Result;

/// Size of the fixed value form in bytes.
pub const VALUE_SIZE: usize = 8;

/// Opaque 64-bit payload accompanying a [`PointKey`](crate::codec::PointKey).
///
/// Measurements are usually stored as an `f32` in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PointValue(pub u64);

impl PointValue {
    /// The all-zero value, used as the delta baseline at the start of a node.
    pub const ZERO: PointValue = PointValue(0);

    /// Stores an `f32` sample in the low 32 bits.
    pub fn from_single(value: f32) -> Self {
        Self(value.to_bits() as u64)
    }

    /// Reinterprets the low 32 bits as an `f32` sample.
    pub fn as_single(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    /// Stores an `f64` sample in the full slot.
    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    /// Reinterprets the full slot as an `f64`.
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Returns the raw slot.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Zeroes the slot.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Copies the slot from `source`.
    pub fn copy_from(&mut self, source: &PointValue) {
        self.0 = source.0;
    }

    /// Appends `varint(previous ^ self)` to `out`, returning the bytes written.
    pub fn write_delta(&self, out: &mut Vec<u8>, previous: &PointValue) -> usize {
        varint::write_u64(out, previous.0 ^ self.0)
    }

    /// Decodes the delta form at the front of `input` into `self`.
    ///
    /// Returns the number of bytes consumed.
    pub fn read_delta(&mut self, input: &[u8], previous: &PointValue) -> Result<usize> {
        let (delta, used) = varint::read_u64(input)?;
        self.0 = delta ^ previous.0;
        Ok(used)
    }
}
