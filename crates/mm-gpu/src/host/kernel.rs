//! Kernels of the host device's built-in library.

use super::KernelArgs;
use crate::backend::{SLOT_A, SLOT_B, SLOT_DESCRIPTOR, SLOT_OUTPUT};
use crate::descriptor::MatrixDescriptor;
use crate::error::Result;

/// Signature of a host kernel: one call per launched thread.
pub type HostKernel = fn(&mut KernelArgs<'_>, ThreadPosition) -> Result<()>;

/// Position of a thread in the dispatch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPosition {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

/// Kernels exposed by the built-in library, by function name.
pub const BUILTIN_KERNELS: &[(&str, HostKernel)] = &[("matmul", matmul)];

/// Compute one output cell `(row, col) = (y, x)`.
///
/// Shapes come from the descriptor at slot 3. Threads outside
/// `a_rows x b_cols` return without touching the output, since whole
/// threadgroups are launched.
pub fn matmul(args: &mut KernelArgs<'_>, gid: ThreadPosition) -> Result<()> {
    let desc = MatrixDescriptor::decode(args.bytes(SLOT_DESCRIPTOR)?)?;
    let row = gid.y;
    let col = gid.x;
    if row >= desc.output_rows() || col >= desc.output_cols() {
        return Ok(());
    }

    let k = desc.a_cols as usize;
    let n = desc.b_cols as usize;
    let mut sum = 0.0f32;
    for p in 0..k {
        sum += args.read_f32(SLOT_A, row * k + p)? * args.read_f32(SLOT_B, p * n + col)?;
    }
    args.write_f32(SLOT_OUTPUT, row * n + col, sum)
}
