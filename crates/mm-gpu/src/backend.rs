use std::fmt::Debug;

use crate::config::KernelSource;
use crate::error::Result;
use crate::grid::Size3;

/// Argument slot of the flattened left operand.
pub const SLOT_A: usize = 0;
/// Argument slot of the flattened right operand.
pub const SLOT_B: usize = 1;
/// Argument slot of the output buffer.
pub const SLOT_OUTPUT: usize = 2;
/// Argument slot of the encoded [`MatrixDescriptor`](crate::MatrixDescriptor).
pub const SLOT_DESCRIPTOR: usize = 3;

/// Occupancy limits reported by a built pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLimits {
    /// Native SIMD/wavefront width of the pipeline.
    pub thread_execution_width: usize,
    /// Upper bound on `width * height * depth` of one threadgroup.
    pub max_total_threads_per_threadgroup: usize,
}

/// A buffer bound to a kernel argument slot.
#[derive(Debug)]
pub struct Binding<'a, B> {
    pub slot: usize,
    pub buffer: &'a B,
}

/// Memory visible to both the host and the device.
pub trait DeviceBuffer: Debug {
    /// Length of the buffer in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait for pluggable compute devices (Metal, host reference, etc.).
///
/// The methods follow the order of a compute submission: load a kernel
/// library, look up a function, build a pipeline, create a queue, stage
/// buffers, dispatch, and read back. Every method reports its own error
/// kind so callers can tell which stage failed.
pub trait ComputeBackend: Debug {
    type Library: Debug;
    type Function: Debug;
    type Pipeline: Debug;
    type Queue: Debug;
    type Buffer: DeviceBuffer;

    /// Returns the name of the underlying device.
    fn name(&self) -> &str;

    /// Load a kernel library. Fails with `LibraryLoad`.
    fn load_library(&self, source: &KernelSource) -> Result<Self::Library>;

    /// Look up a kernel function by name. Fails with `LibraryLoad`.
    fn function(&self, library: &Self::Library, name: &str) -> Result<Self::Function>;

    /// Build an executable pipeline. Fails with `PipelineBuild`.
    fn build_pipeline(&self, function: &Self::Function) -> Result<Self::Pipeline>;

    /// Query the occupancy limits of a pipeline.
    fn pipeline_limits(&self, pipeline: &Self::Pipeline) -> PipelineLimits;

    /// Create a command submission queue. Fails with `QueueCreation`.
    fn new_queue(&self) -> Result<Self::Queue>;

    /// Allocate a shared buffer initialised with `bytes`.
    /// Fails with `BufferAllocation`.
    fn new_buffer_with_bytes(&self, label: &'static str, bytes: &[u8]) -> Result<Self::Buffer>;

    /// Allocate a zero-filled shared buffer of `len` bytes.
    /// Fails with `BufferAllocation`.
    fn new_zeroed_buffer(&self, label: &'static str, len: usize) -> Result<Self::Buffer>;

    /// Encode one command buffer that binds `bindings`, dispatches `grid`
    /// threads in groups of `threadgroup`, and submits it. Blocks until the
    /// device reports completion. Fails with `Dispatch`.
    fn dispatch(
        &self,
        queue: &Self::Queue,
        pipeline: &Self::Pipeline,
        bindings: &[Binding<'_, Self::Buffer>],
        grid: Size3,
        threadgroup: Size3,
    ) -> Result<()>;

    /// Read the first `count` floats of a buffer.
    fn read_f32(&self, buffer: &Self::Buffer, count: usize) -> Result<Vec<f32>>;
}
