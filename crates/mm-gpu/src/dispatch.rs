use log::{debug, info, trace};

use crate::backend::{ComputeBackend, DeviceBuffer, PipelineLimits};
use crate::config::{MatmulConfig, ThreadgroupPolicy};
use crate::descriptor::MatrixDescriptor;
use crate::encoding;
use crate::error::{MatmulError, Operand, Result};
use crate::grid;
use crate::matrix::Matrix;
use crate::staging::StagedBuffers;

/// Check that `a @ b` can be dispatched and derive its descriptor.
///
/// Runs before any device work: empty operands and a mismatched inner
/// dimension are rejected here.
pub fn validate(a: &Matrix, b: &Matrix) -> Result<MatrixDescriptor> {
    for (operand, m) in [(Operand::A, a), (Operand::B, b)] {
        if m.is_empty() {
            return Err(MatmulError::EmptyMatrix {
                operand,
                rows: m.rows(),
                cols: m.cols(),
            });
        }
    }
    if a.cols() != b.rows() {
        return Err(MatmulError::DimensionMismatch {
            a_rows: a.rows(),
            a_cols: a.cols(),
            b_rows: b.rows(),
            b_cols: b.cols(),
        });
    }
    MatrixDescriptor::new(a.shape(), b.shape())
}

/// A device, pipeline and command queue, set up once and reused.
///
/// Each [`multiply`](MatmulContext::multiply) allocates its own buffers and
/// command buffer, blocks until the device finishes, and returns a fresh
/// matrix. Buffers are never shared between calls.
#[derive(Debug)]
pub struct MatmulContext<B: ComputeBackend> {
    backend: B,
    pipeline: B::Pipeline,
    queue: B::Queue,
    limits: PipelineLimits,
    threadgroup: ThreadgroupPolicy,
}

impl<B: ComputeBackend> MatmulContext<B> {
    /// Load the kernel library, look up the kernel function, build its
    /// pipeline, and create a command queue. Any failure aborts setup.
    pub fn new(backend: B, config: &MatmulConfig) -> Result<Self> {
        let library = backend.load_library(&config.kernel)?;
        let function = backend.function(&library, &config.function_name)?;
        let pipeline = backend.build_pipeline(&function)?;
        let limits = backend.pipeline_limits(&pipeline);
        let queue = backend.new_queue()?;

        info!(
            "using {} device: `{}` execution width {}, max {} threads per threadgroup",
            backend.name(),
            config.function_name,
            limits.thread_execution_width,
            limits.max_total_threads_per_threadgroup
        );

        Ok(MatmulContext {
            backend,
            pipeline,
            queue,
            limits,
            threadgroup: config.threadgroup,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Occupancy limits of the built pipeline.
    pub fn limits(&self) -> PipelineLimits {
        self.limits
    }

    /// Compute `a @ b` on the device.
    ///
    /// The result has shape `a.rows() x b.cols()`. On error no partial
    /// result is returned.
    pub fn multiply(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        let desc = validate(a, b)?;
        let staged = StagedBuffers::stage(&self.backend, a, b, &desc)?;

        let grid = grid::output_grid(&desc);
        let threadgroup = grid::threadgroup_size(&self.limits, &self.threadgroup)?;
        debug!(
            "dispatch [{}x{}] @ [{}x{}]: grid {}x{}x{}, threadgroup {}x{}x{}",
            desc.a_rows,
            desc.a_cols,
            desc.b_rows,
            desc.b_cols,
            grid.width,
            grid.height,
            grid.depth,
            threadgroup.width,
            threadgroup.height,
            threadgroup.depth
        );

        let bindings = staged.bindings();
        for binding in &bindings {
            trace!("bind slot {} -> {} bytes", binding.slot, binding.buffer.len());
        }
        self.backend
            .dispatch(&self.queue, &self.pipeline, &bindings, grid, threadgroup)?;
        debug!("dispatch completed");

        let flat = self.backend.read_f32(&staged.output, staged.output_len())?;
        Matrix::new(flat, desc.output_rows(), desc.output_cols())
    }

    /// [`multiply`](Self::multiply) on nested rows.
    pub fn multiply_rows(&self, a: &[Vec<f32>], b: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let a = Matrix::from_rows(a)?;
        let b = Matrix::from_rows(b)?;
        let c = self.multiply(&a, &b)?;
        encoding::reshape(c.as_slice(), c.rows(), c.cols())
    }
}

#[cfg(all(feature = "metal", target_os = "macos"))]
pub type DefaultBackend = crate::metal::MetalBackend;

#[cfg(not(all(feature = "metal", target_os = "macos")))]
pub type DefaultBackend = crate::host::HostBackend;

/// Acquire the default compute device.
///
/// With the `metal` feature on macOS this is the system default Metal
/// device; otherwise it is the host reference device.
pub fn default_backend() -> Result<DefaultBackend> {
    #[cfg(all(feature = "metal", target_os = "macos"))]
    {
        crate::metal::MetalBackend::system_default()
    }
    #[cfg(not(all(feature = "metal", target_os = "macos")))]
    {
        Ok(crate::host::HostBackend::new())
    }
}

/// Build a context on the default device from `config`.
pub fn default_context(config: &MatmulConfig) -> Result<MatmulContext<DefaultBackend>> {
    MatmulContext::new(default_backend()?, config)
}

/// Multiply two matrices on the default device.
///
/// Inputs are validated before the device is touched. Device setup runs on
/// every call; hold a [`MatmulContext`] to reuse it across calls.
pub fn multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    validate(a, b)?;
    default_context(&MatmulConfig::from_env())?.multiply(a, b)
}
