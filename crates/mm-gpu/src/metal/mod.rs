//! Metal GPU compute backend (macOS only).
//!
//! All buffers use `StorageModeShared`, so inputs are written and outputs
//! read through the buffer's contents pointer without blit passes.

pub mod shader;

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use log::{debug, info};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::{NSError, NSString, NSURL};
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
    MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice,
    MTLFunction, MTLLibrary, MTLResource, MTLResourceOptions, MTLSize,
};

use crate::backend::{Binding, ComputeBackend, DeviceBuffer, PipelineLimits};
use crate::config::KernelSource;
use crate::encoding;
use crate::error::{MatmulError, Result};
use crate::grid::Size3;

pub use shader::MATMUL_MSL;

// MTLCreateSystemDefaultDevice only returns a device when CoreGraphics is linked.
#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {}

fn describe(error: &NSError) -> String {
    error.localizedDescription().to_string()
}

fn mtl_size(size: Size3) -> MTLSize {
    MTLSize {
        width: size.width,
        height: size.height,
        depth: size.depth,
    }
}

pub struct MetalLibrary {
    raw: Retained<ProtocolObject<dyn MTLLibrary>>,
}

impl fmt::Debug for MetalLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalLibrary").finish_non_exhaustive()
    }
}

pub struct MetalFunction {
    name: String,
    raw: Retained<ProtocolObject<dyn MTLFunction>>,
}

impl fmt::Debug for MetalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalFunction").field("name", &self.name).finish()
    }
}

pub struct MetalPipeline {
    name: String,
    raw: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
}

impl fmt::Debug for MetalPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalPipeline").field("name", &self.name).finish()
    }
}

pub struct MetalQueue {
    raw: Retained<ProtocolObject<dyn MTLCommandQueue>>,
}

impl fmt::Debug for MetalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalQueue").finish_non_exhaustive()
    }
}

/// A `StorageModeShared` Metal buffer.
pub struct MetalBuffer {
    label: &'static str,
    raw: Retained<ProtocolObject<dyn MTLBuffer>>,
}

impl fmt::Debug for MetalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalBuffer")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

impl DeviceBuffer for MetalBuffer {
    fn len(&self) -> usize {
        self.raw.length()
    }
}

/// Metal compute backend bound to one device.
pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    name: String,
}

impl fmt::Debug for MetalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalBackend").field("name", &self.name).finish()
    }
}

impl MetalBackend {
    /// Acquire the system default Metal device.
    ///
    /// # Errors
    /// Returns `DeviceUnavailable` when the host has no Metal device.
    pub fn system_default() -> Result<Self> {
        // SAFETY: no preconditions; returns None without a GPU.
        let device =
            unsafe { MTLCreateSystemDefaultDevice() }.ok_or(MatmulError::DeviceUnavailable)?;
        let name = device.name().to_string();
        info!("Using GPU device = {}", name);
        Ok(MetalBackend { device, name })
    }

    fn compile(&self, source: &str) -> Result<MetalLibrary> {
        let source = NSString::from_str(source);
        // SAFETY: the source is a valid NSString and default options are used.
        let raw = unsafe { self.device.newLibraryWithSource_options_error(&source, None) }
            .map_err(|e| MatmulError::LibraryLoad(describe(&e)))?;
        Ok(MetalLibrary { raw })
    }

    fn buffer(
        &self,
        label: &'static str,
        raw: Option<Retained<ProtocolObject<dyn MTLBuffer>>>,
        bytes: usize,
    ) -> Result<MetalBuffer> {
        let raw = raw.ok_or(MatmulError::BufferAllocation { label, bytes })?;
        raw.setLabel(Some(&NSString::from_str(label)));
        debug!("metal: allocated {} ({} bytes)", label, bytes);
        Ok(MetalBuffer { label, raw })
    }
}

impl ComputeBackend for MetalBackend {
    type Library = MetalLibrary;
    type Function = MetalFunction;
    type Pipeline = MetalPipeline;
    type Queue = MetalQueue;
    type Buffer = MetalBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn load_library(&self, source: &KernelSource) -> Result<MetalLibrary> {
        match source {
            KernelSource::Default => match self.device.newDefaultLibrary() {
                Some(raw) => Ok(MetalLibrary { raw }),
                None => {
                    debug!("metal: no default library in bundle, compiling built-in kernel");
                    self.compile(MATMUL_MSL)
                }
            },
            KernelSource::Source(text) => self.compile(text),
            KernelSource::File(path) => {
                let path_str = path.to_str().ok_or_else(|| {
                    MatmulError::LibraryLoad(format!("non UTF-8 path {}", path.display()))
                })?;
                let url = NSURL::fileURLWithPath(&NSString::from_str(path_str));
                // SAFETY: the URL is a file URL built above.
                let raw = unsafe { self.device.newLibraryWithURL_error(&url) }
                    .map_err(|e| {
                        MatmulError::LibraryLoad(format!("{}: {}", path.display(), describe(&e)))
                    })?;
                Ok(MetalLibrary { raw })
            }
        }
    }

    fn function(&self, library: &MetalLibrary, name: &str) -> Result<MetalFunction> {
        let raw = library
            .raw
            .newFunctionWithName(&NSString::from_str(name))
            .ok_or_else(|| {
                MatmulError::LibraryLoad(format!("function `{}` not found in library", name))
            })?;
        Ok(MetalFunction {
            name: name.to_string(),
            raw,
        })
    }

    fn build_pipeline(&self, function: &MetalFunction) -> Result<MetalPipeline> {
        let raw = self
            .device
            .newComputePipelineStateWithFunction_error(&function.raw)
            .map_err(|e| {
                MatmulError::PipelineBuild(format!("`{}`: {}", function.name, describe(&e)))
            })?;
        Ok(MetalPipeline {
            name: function.name.clone(),
            raw,
        })
    }

    fn pipeline_limits(&self, pipeline: &MetalPipeline) -> PipelineLimits {
        PipelineLimits {
            thread_execution_width: pipeline.raw.threadExecutionWidth(),
            max_total_threads_per_threadgroup: pipeline.raw.maxTotalThreadsPerThreadgroup(),
        }
    }

    fn new_queue(&self) -> Result<MetalQueue> {
        let raw = self.device.newCommandQueue().ok_or(MatmulError::QueueCreation)?;
        Ok(MetalQueue { raw })
    }

    fn new_buffer_with_bytes(&self, label: &'static str, bytes: &[u8]) -> Result<MetalBuffer> {
        let pointer: NonNull<c_void> = NonNull::from(bytes).cast();
        // SAFETY: `pointer` is valid for `bytes.len()` reads; Metal copies the
        // data before returning.
        let raw = unsafe {
            self.device.newBufferWithBytes_length_options(
                pointer,
                bytes.len(),
                MTLResourceOptions::StorageModeShared,
            )
        };
        self.buffer(label, raw, bytes.len())
    }

    fn new_zeroed_buffer(&self, label: &'static str, len: usize) -> Result<MetalBuffer> {
        // SAFETY: a plain allocation request with no pointers involved.
        let raw = unsafe {
            self.device
                .newBufferWithLength_options(len, MTLResourceOptions::StorageModeShared)
        };
        let buffer = self.buffer(label, raw, len)?;
        // SAFETY: shared storage is host-addressable for `len` bytes and the
        // buffer is not yet visible to the GPU.
        unsafe {
            std::ptr::write_bytes(buffer.raw.contents().as_ptr().cast::<u8>(), 0, len);
        }
        Ok(buffer)
    }

    fn dispatch(
        &self,
        queue: &MetalQueue,
        pipeline: &MetalPipeline,
        bindings: &[Binding<'_, MetalBuffer>],
        grid: Size3,
        threadgroup: Size3,
    ) -> Result<()> {
        let command_buffer = queue
            .raw
            .commandBuffer()
            .ok_or_else(|| MatmulError::Dispatch("failed to create command buffer".to_string()))?;
        let encoder = command_buffer
            .computeCommandEncoder()
            .ok_or_else(|| MatmulError::Dispatch("failed to create compute encoder".to_string()))?;

        encoder.setComputePipelineState(&pipeline.raw);
        for binding in bindings {
            // SAFETY: every bound buffer outlives the blocking wait below.
            unsafe {
                encoder.setBuffer_offset_atIndex(Some(&*binding.buffer.raw), 0, binding.slot)
            };
        }
        encoder.dispatchThreads_threadsPerThreadgroup(mtl_size(grid), mtl_size(threadgroup));
        encoder.endEncoding();

        command_buffer.commit();
        command_buffer.waitUntilCompleted();

        if command_buffer.status() == MTLCommandBufferStatus::Error {
            let reason = command_buffer
                .error()
                .map(|e| describe(&e))
                .unwrap_or_else(|| "command buffer failed".to_string());
            return Err(MatmulError::Dispatch(reason));
        }
        Ok(())
    }

    fn read_f32(&self, buffer: &MetalBuffer, count: usize) -> Result<Vec<f32>> {
        let len = count * encoding::ELEMENT_SIZE;
        if len > buffer.len() {
            return Err(MatmulError::Dispatch(format!(
                "cannot read {} floats from {} byte buffer {}",
                count,
                buffer.len(),
                buffer.label
            )));
        }
        // SAFETY: the command buffer using this buffer has completed and the
        // shared contents are valid for `len` bytes.
        let bytes = unsafe {
            let base = buffer.raw.contents().as_ptr().cast::<u8>().cast_const();
            std::slice::from_raw_parts(base, len)
        };
        encoding::floats_from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatmulConfig;
    use crate::dispatch::MatmulContext;
    use crate::matrix::Matrix;
    use approx::assert_abs_diff_eq;

    fn context() -> Option<MatmulContext<MetalBackend>> {
        let backend = MetalBackend::system_default().ok()?;
        Some(MatmulContext::new(backend, &MatmulConfig::default()).unwrap())
    }

    #[test]
    fn test_metal_matches_reference() {
        let Some(ctx) = context() else {
            eprintln!("no Metal device, skipping");
            return;
        };
        let a = Matrix::new((0..20).map(|v| v as f32 * 0.5).collect(), 10, 2).unwrap();
        let b = Matrix::new((0..8).map(|v| 1.0 - v as f32).collect(), 2, 4).unwrap();
        let c = ctx.multiply(&a, &b).unwrap();
        let want = a.reference_matmul(&b).unwrap();
        for (g, w) in c.as_slice().iter().zip(want.as_slice()) {
            assert_abs_diff_eq!(*g, *w, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_metal_missing_function() {
        let Ok(backend) = MetalBackend::system_default() else {
            return;
        };
        let config = MatmulConfig::default().with_function_name("not_a_kernel");
        assert!(matches!(
            MatmulContext::new(backend, &config),
            Err(MatmulError::LibraryLoad(_))
        ));
    }

    #[test]
    fn test_metal_bad_source() {
        let Ok(backend) = MetalBackend::system_default() else {
            return;
        };
        let config = MatmulConfig::default().with_kernel(KernelSource::Source("not msl".into()));
        assert!(matches!(
            MatmulContext::new(backend, &config),
            Err(MatmulError::LibraryLoad(_))
        ));
    }
}
