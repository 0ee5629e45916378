//! Host-side layout transforms between nested rows, flat row-major
//! buffers, and the raw bytes handed to a device.
//!
//! Element `[i][j]` of an `R x C` matrix sits at flat offset `i * C + j`.

use crate::error::{MatmulError, Result};

/// Size in bytes of one matrix element as stored in device buffers.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// Flatten nested rows into one contiguous row-major vector.
///
/// Row 0 is emitted in full, then row 1, and so on. Every row must have the
/// length of row 0.
pub fn flatten(rows: &[Vec<f32>]) -> Result<Vec<f32>> {
    let cols = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(rows.len() * cols);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != cols {
            return Err(MatmulError::RaggedRows {
                row: i,
                expected: cols,
                got: row.len(),
            });
        }
        flat.extend_from_slice(row);
    }
    Ok(flat)
}

/// Number of elements in a `rows x cols` matrix holding `len` elements.
///
/// Fails with `ShapeMismatch` when the product overflows or differs from
/// `len`.
pub fn element_count(rows: usize, cols: usize, len: usize) -> Result<usize> {
    match rows.checked_mul(cols) {
        Some(n) if n == len => Ok(n),
        _ => Err(MatmulError::ShapeMismatch { rows, cols, len }),
    }
}

/// Reshape a flat row-major buffer back into `rows` nested rows of `cols`.
pub fn reshape(flat: &[f32], rows: usize, cols: usize) -> Result<Vec<Vec<f32>>> {
    element_count(rows, cols, flat.len())?;
    if cols == 0 {
        return Ok(vec![Vec::new(); rows]);
    }
    Ok(flat.chunks_exact(cols).map(<[f32]>::to_vec).collect())
}

/// Byte length of a device buffer holding `rows * cols` elements.
pub fn byte_len(rows: usize, cols: usize) -> usize {
    rows * cols * ELEMENT_SIZE
}

/// View a float slice as the bytes uploaded to a device buffer.
pub fn as_bytes(data: &[f32]) -> &[u8] {
    bytemuck::cast_slice(data)
}

/// Copy device bytes back into floats. The source need not be aligned.
pub fn floats_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % ELEMENT_SIZE != 0 {
        return Err(MatmulError::Dispatch(format!(
            "buffer length {} is not a multiple of {}",
            bytes.len(),
            ELEMENT_SIZE
        )));
    }
    Ok(bytes
        .chunks_exact(ELEMENT_SIZE)
        .map(|chunk| {
            let mut buf4 = [0u8; 4];
            buf4.copy_from_slice(chunk);
            f32::from_ne_bytes(buf4)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_row_major() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        assert_eq!(flatten(&rows).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_flatten_ragged() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        match flatten(&rows) {
            Err(MatmulError::RaggedRows { row, expected, got }) => {
                assert_eq!((row, expected, got), (1, 2, 1));
            }
            other => panic!("expected RaggedRows, got {:?}", other),
        }
    }

    #[test]
    fn test_flatten_reshape_roundtrip() {
        let rows = vec![
            vec![0.1, -2.5, 3.75, f32::MAX],
            vec![f32::MIN_POSITIVE, 1e-30, -0.0, 7.0],
            vec![9.0, 8.0, 7.0, 6.0],
        ];
        let flat = flatten(&rows).unwrap();
        let back = reshape(&flat, 3, 4).unwrap();
        assert_eq!(back, rows);
        for (a, b) in back.iter().flatten().zip(rows.iter().flatten()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_reshape_length_mismatch() {
        assert!(reshape(&[1.0, 2.0, 3.0], 2, 2).is_err());
    }

    #[test]
    fn test_reshape_overflowing_shape() {
        let huge = 1usize << (usize::BITS / 2);
        assert!(matches!(
            reshape(&[], huge, huge),
            Err(MatmulError::ShapeMismatch { len: 0, .. })
        ));
        assert!(element_count(usize::MAX, 2, 0).is_err());
        assert_eq!(element_count(3, 4, 12).unwrap(), 12);
    }

    #[test]
    fn test_byte_len() {
        assert_eq!(byte_len(10, 2), 80);
        assert_eq!(byte_len(10, 4), 160);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let data = vec![1.5f32, -3.0, 42.0];
        let bytes = as_bytes(&data);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &1.5f32.to_ne_bytes());
        assert_eq!(floats_from_bytes(bytes).unwrap(), data);
    }

    #[test]
    fn test_floats_from_unaligned_bytes() {
        let mut raw = vec![0u8];
        raw.extend_from_slice(&2.0f32.to_ne_bytes());
        assert_eq!(floats_from_bytes(&raw[1..]).unwrap(), vec![2.0]);
        assert!(floats_from_bytes(&raw).is_err());
    }
}
