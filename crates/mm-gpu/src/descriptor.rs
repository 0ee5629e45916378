//! The 16-byte shape record bound at argument slot 3.
//!
//! Layout (all fields little-endian `i32`):
//!
//! | offset | field  |
//! |--------|--------|
//! | 0      | a_rows |
//! | 4      | a_cols |
//! | 8      | b_rows |
//! | 12     | b_cols |
//!
//! Kernels decode dimensions at these fixed offsets, so the order and width
//! of the fields must not change.

use crate::error::{MatmulError, Result};

pub const A_ROWS_OFFSET: usize = 0;
pub const A_COLS_OFFSET: usize = 4;
pub const B_ROWS_OFFSET: usize = 8;
pub const B_COLS_OFFSET: usize = 12;

/// Encoded size of a [`MatrixDescriptor`] in bytes.
pub const DESCRIPTOR_LEN: usize = 16;

/// Shapes of both operands of one multiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixDescriptor {
    pub a_rows: i32,
    pub a_cols: i32,
    pub b_rows: i32,
    pub b_cols: i32,
}

fn to_field(dim: usize) -> Result<i32> {
    i32::try_from(dim).map_err(|_| MatmulError::DimensionOverflow(dim))
}

fn read_field(bytes: &[u8], offset: usize) -> i32 {
    let mut buf4 = [0u8; 4];
    buf4.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(buf4)
}

impl MatrixDescriptor {
    /// Build a descriptor from operand shapes `(a_rows, a_cols)` and
    /// `(b_rows, b_cols)`.
    ///
    /// # Errors
    /// Returns `DimensionOverflow` if any dimension exceeds `i32::MAX`.
    pub fn new(a: (usize, usize), b: (usize, usize)) -> Result<Self> {
        Ok(MatrixDescriptor {
            a_rows: to_field(a.0)?,
            a_cols: to_field(a.1)?,
            b_rows: to_field(b.0)?,
            b_cols: to_field(b.1)?,
        })
    }

    /// Serialize to the fixed 16-byte wire layout.
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        bytes[A_ROWS_OFFSET..A_ROWS_OFFSET + 4].copy_from_slice(&self.a_rows.to_le_bytes());
        bytes[A_COLS_OFFSET..A_COLS_OFFSET + 4].copy_from_slice(&self.a_cols.to_le_bytes());
        bytes[B_ROWS_OFFSET..B_ROWS_OFFSET + 4].copy_from_slice(&self.b_rows.to_le_bytes());
        bytes[B_COLS_OFFSET..B_COLS_OFFSET + 4].copy_from_slice(&self.b_cols.to_le_bytes());
        bytes
    }

    /// Parse a descriptor from the start of `bytes`.
    ///
    /// Trailing bytes past [`DESCRIPTOR_LEN`] are ignored; negative fields
    /// are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_LEN {
            return Err(MatmulError::InvalidDescriptor(format!(
                "expected {} bytes, got {}",
                DESCRIPTOR_LEN,
                bytes.len()
            )));
        }
        let desc = MatrixDescriptor {
            a_rows: read_field(bytes, A_ROWS_OFFSET),
            a_cols: read_field(bytes, A_COLS_OFFSET),
            b_rows: read_field(bytes, B_ROWS_OFFSET),
            b_cols: read_field(bytes, B_COLS_OFFSET),
        };
        if desc.a_rows < 0 || desc.a_cols < 0 || desc.b_rows < 0 || desc.b_cols < 0 {
            return Err(MatmulError::InvalidDescriptor(format!(
                "negative dimension in {:?}",
                desc
            )));
        }
        Ok(desc)
    }

    /// Checks the shared inner dimension, `a_cols == b_rows`.
    pub fn is_compatible(&self) -> bool {
        self.a_cols == self.b_rows
    }

    /// Number of rows in the product.
    pub fn output_rows(&self) -> usize {
        self.a_rows.max(0) as usize
    }

    /// Number of columns in the product.
    pub fn output_cols(&self) -> usize {
        self.b_cols.max(0) as usize
    }

    /// Number of elements in the product, `a_rows * b_cols`.
    pub fn output_len(&self) -> usize {
        self.output_rows() * self.output_cols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_byte_layout() {
        let desc = MatrixDescriptor {
            a_rows: 10,
            a_cols: 2,
            b_rows: 2,
            b_cols: 0x0102_0304,
        };
        let bytes = desc.encode();
        assert_eq!(
            bytes,
            [
                10, 0, 0, 0, // a_rows
                2, 0, 0, 0, // a_cols
                2, 0, 0, 0, // b_rows
                0x04, 0x03, 0x02, 0x01, // b_cols
            ]
        );
    }

    #[test]
    fn test_decode_fixed_offsets() {
        let mut bytes = [0u8; 20];
        bytes[0..4].copy_from_slice(&7i32.to_le_bytes());
        bytes[4..8].copy_from_slice(&3i32.to_le_bytes());
        bytes[8..12].copy_from_slice(&3i32.to_le_bytes());
        bytes[12..16].copy_from_slice(&5i32.to_le_bytes());
        bytes[16..20].copy_from_slice(&[0xff; 4]);
        let desc = MatrixDescriptor::decode(&bytes).unwrap();
        assert_eq!(desc, MatrixDescriptor::new((7, 3), (3, 5)).unwrap());
        assert_eq!(desc.output_len(), 35);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(MatrixDescriptor::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_decode_negative_field() {
        let mut bytes = MatrixDescriptor::new((1, 1), (1, 1)).unwrap().encode();
        bytes[B_COLS_OFFSET..B_COLS_OFFSET + 4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            MatrixDescriptor::decode(&bytes),
            Err(MatmulError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_overflow() {
        let too_big = i32::MAX as usize + 1;
        assert!(matches!(
            MatrixDescriptor::new((too_big, 1), (1, 1)),
            Err(MatmulError::DimensionOverflow(d)) if d == too_big
        ));
    }

    #[test]
    fn test_compatibility() {
        assert!(MatrixDescriptor::new((4, 3), (3, 2)).unwrap().is_compatible());
        assert!(!MatrixDescriptor::new((4, 3), (2, 3)).unwrap().is_compatible());
    }
}
