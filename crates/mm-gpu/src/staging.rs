use log::debug;

use crate::backend::{Binding, ComputeBackend, SLOT_A, SLOT_B, SLOT_DESCRIPTOR, SLOT_OUTPUT};
use crate::descriptor::MatrixDescriptor;
use crate::encoding::{self, ELEMENT_SIZE};
use crate::error::Result;
use crate::matrix::Matrix;

/// The four per-call device buffers of one multiplication.
///
/// Buffers are allocated for a single call and dropped with it; nothing is
/// pooled or shared between calls.
#[derive(Debug)]
pub struct StagedBuffers<B: ComputeBackend> {
    pub a: B::Buffer,
    pub b: B::Buffer,
    pub output: B::Buffer,
    pub descriptor: B::Buffer,
    output_len: usize,
}

impl<B: ComputeBackend> StagedBuffers<B> {
    /// Allocate and fill buffers for `a @ b`.
    ///
    /// Sizes are `a_rows*a_cols*4`, `b_rows*b_cols*4`, 16 bytes for the
    /// descriptor, and a zeroed `a_rows*b_cols*4` output. The first failed
    /// allocation aborts staging.
    pub fn stage(backend: &B, a: &Matrix, b: &Matrix, desc: &MatrixDescriptor) -> Result<Self> {
        let a_buf = backend.new_buffer_with_bytes("matrix A", encoding::as_bytes(a.as_slice()))?;
        let b_buf = backend.new_buffer_with_bytes("matrix B", encoding::as_bytes(b.as_slice()))?;
        let desc_buf = backend.new_buffer_with_bytes("descriptor", &desc.encode())?;

        let output_len = desc.output_len();
        let output = backend.new_zeroed_buffer("output", output_len * ELEMENT_SIZE)?;

        debug!(
            "staged buffers: A={}B B={}B descriptor={}B output={}B",
            encoding::byte_len(a.rows(), a.cols()),
            encoding::byte_len(b.rows(), b.cols()),
            desc.encode().len(),
            output_len * ELEMENT_SIZE
        );

        Ok(StagedBuffers {
            a: a_buf,
            b: b_buf,
            output,
            descriptor: desc_buf,
            output_len,
        })
    }

    /// Number of floats in the output buffer.
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// The kernel's argument table in slot order.
    pub fn bindings(&self) -> [Binding<'_, B::Buffer>; 4] {
        [
            Binding {
                slot: SLOT_A,
                buffer: &self.a,
            },
            Binding {
                slot: SLOT_B,
                buffer: &self.b,
            },
            Binding {
                slot: SLOT_OUTPUT,
                buffer: &self.output,
            },
            Binding {
                slot: SLOT_DESCRIPTOR,
                buffer: &self.descriptor,
            },
        ]
    }
}
