use std::fmt;

use crate::encoding;
use crate::error::{MatmulError, Result};

/// A dense `rows x cols` matrix of `f32`, stored row-major.
///
/// Matrices are immutable once built; multiplication always produces a new
/// matrix owned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Create a matrix from row-major data.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `data.len() != rows * cols`, or if
    /// `rows * cols` overflows.
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        encoding::element_count(rows, cols, data.len())?;
        Ok(Matrix { data, rows, cols })
    }

    /// Create a matrix from nested rows, all of which must share a length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let data = encoding::flatten(rows)?;
        let cols = rows.first().map_or(0, Vec::len);
        Ok(Matrix {
            data,
            rows: rows.len(),
            cols,
        })
    }

    /// Create a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        let len = rows.checked_mul(cols).ok_or(MatmulError::ShapeMismatch {
            rows,
            cols,
            len: 0,
        })?;
        Matrix::new(vec![0.0; len], rows, cols)
    }

    /// Create an `n x n` identity matrix.
    pub fn identity(n: usize) -> Result<Self> {
        let mut m = Matrix::zeros(n, n)?;
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Returns `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// True if the matrix has no rows or no columns.
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Element at `[row][col]`, or `None` when out of range.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }

    /// The flat row-major elements.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the matrix, returning its row-major elements.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Copy the matrix out as nested rows.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks_exact(self.cols).map(<[f32]>::to_vec).collect()
    }

    /// Scalar triple-loop product, used to check device results.
    pub fn reference_matmul(&self, other: &Matrix) -> Result<Matrix> {
        let (m, k) = self.shape();
        let (k2, n) = other.shape();
        if k != k2 {
            return Err(MatmulError::DimensionMismatch {
                a_rows: m,
                a_cols: k,
                b_rows: k2,
                b_cols: n,
            });
        }

        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += self.data[i * k + p] * other.data[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        Matrix::new(c, m, n)
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, row) in self.to_rows().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", row)?;
        }
        write!(f, "]")
    }
}

impl TryFrom<Vec<Vec<f32>>> for Matrix {
    type Error = MatmulError;

    fn try_from(rows: Vec<Vec<f32>>) -> Result<Self> {
        Matrix::from_rows(&rows)
    }
}
