//! A compute device that runs kernels on the calling thread.
//!
//! It follows the same execution model as a GPU queue: shared byte buffers
//! bound to numbered argument slots, pipelines with occupancy limits, and
//! dispatches that launch whole threadgroups. Buffer accesses from kernels
//! are bounds-checked, so a kernel that strays outside a buffer fails the
//! dispatch instead of corrupting memory.

pub mod kernel;

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use log::{debug, trace};

use crate::backend::{Binding, ComputeBackend, DeviceBuffer, PipelineLimits};
use crate::config::KernelSource;
use crate::encoding::{self, ELEMENT_SIZE};
use crate::error::{MatmulError, Result};
use crate::grid::{self, Size3};

pub use kernel::{HostKernel, ThreadPosition, BUILTIN_KERNELS};

/// Resource limits of the host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    pub thread_execution_width: usize,
    pub max_total_threads_per_threadgroup: usize,
    /// Largest buffer the device will allocate, in bytes.
    pub max_buffer_length: usize,
    /// Number of command queues the device will hand out.
    pub max_command_queues: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        HostLimits {
            thread_execution_width: 32,
            max_total_threads_per_threadgroup: 1024,
            max_buffer_length: 256 * 1024 * 1024,
            max_command_queues: 64,
        }
    }
}

/// One successful buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub label: &'static str,
    pub bytes: usize,
}

/// What a completed dispatch bound and launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub function: &'static str,
    /// `(slot, buffer label)` in binding order.
    pub bindings: Vec<(usize, &'static str)>,
    pub grid: Size3,
    pub threadgroup: Size3,
    /// Threads actually run, including those past the grid edge.
    pub threads_launched: usize,
}

/// Activity counters of a [`HostBackend`].
///
/// The counts are always kept. `allocations` and `dispatches` hold
/// per-call records only on a backend built with
/// [`recording`](HostBackend::recording).
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub allocation_count: usize,
    pub dispatch_count: usize,
    pub queues_created: usize,
    pub allocations: Vec<Allocation>,
    pub dispatches: Vec<DispatchRecord>,
}

/// Library handle: the built-in kernel table.
#[derive(Clone)]
pub struct HostLibrary {
    kernels: &'static [(&'static str, HostKernel)],
}

impl fmt::Debug for HostLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.kernels.iter().map(|(name, _)| name))
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct HostFunction {
    name: &'static str,
    kernel: HostKernel,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HostPipeline {
    function: HostFunction,
    limits: PipelineLimits,
}

#[derive(Debug)]
pub struct HostQueue {
    id: usize,
}

/// A host-visible buffer.
#[derive(Debug)]
pub struct HostBuffer {
    label: &'static str,
    data: RefCell<Vec<u8>>,
}

impl HostBuffer {
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.borrow().len()
    }
}

/// Buffers visible to a kernel, indexed by argument slot.
#[derive(Debug)]
pub struct KernelArgs<'a> {
    slots: Vec<Option<&'a mut [u8]>>,
}

impl<'a> KernelArgs<'a> {
    fn slot(&self, slot: usize) -> Result<&[u8]> {
        self.slots
            .get(slot)
            .and_then(|s| s.as_deref())
            .ok_or_else(|| MatmulError::Dispatch(format!("no buffer bound at slot {}", slot)))
    }

    /// Raw bytes of the buffer at `slot`.
    pub fn bytes(&self, slot: usize) -> Result<&[u8]> {
        self.slot(slot)
    }

    /// Read element `index` of the float buffer at `slot`.
    pub fn read_f32(&self, slot: usize, index: usize) -> Result<f32> {
        let bytes = self.slot(slot)?;
        let start = index * ELEMENT_SIZE;
        let chunk = bytes.get(start..start + ELEMENT_SIZE).ok_or_else(|| {
            MatmulError::Dispatch(format!(
                "read of element {} past end of slot {} ({} bytes)",
                index,
                slot,
                bytes.len()
            ))
        })?;
        let mut buf4 = [0u8; 4];
        buf4.copy_from_slice(chunk);
        Ok(f32::from_ne_bytes(buf4))
    }

    /// Write element `index` of the float buffer at `slot`.
    pub fn write_f32(&mut self, slot: usize, index: usize, value: f32) -> Result<()> {
        let bytes = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.as_deref_mut())
            .ok_or_else(|| MatmulError::Dispatch(format!("no buffer bound at slot {}", slot)))?;
        let len = bytes.len();
        let start = index * ELEMENT_SIZE;
        let chunk = bytes.get_mut(start..start + ELEMENT_SIZE).ok_or_else(|| {
            MatmulError::Dispatch(format!(
                "write of element {} past end of slot {} ({} bytes)",
                index, slot, len
            ))
        })?;
        chunk.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }
}

/// Reference compute device executing kernels on the CPU.
#[derive(Debug, Default)]
pub struct HostBackend {
    limits: HostLimits,
    record: bool,
    stats: Mutex<HostStats>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_limits(HostLimits::default())
    }

    pub fn with_limits(limits: HostLimits) -> Self {
        HostBackend {
            limits,
            record: false,
            stats: Mutex::new(HostStats::default()),
        }
    }

    /// Keep a record of every allocation and dispatch. Records grow with
    /// each call, so this is meant for short-lived backends.
    pub fn recording(mut self) -> Self {
        self.record = true;
        self
    }

    pub fn limits(&self) -> &HostLimits {
        &self.limits
    }

    /// Snapshot of allocations, queues and dispatches so far.
    pub fn stats(&self) -> HostStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> MutexGuard<'_, HostStats> {
        // Stats are plain counters; a panic elsewhere cannot leave them torn.
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check `bytes` against the device limit, then build the contents.
    fn allocate(
        &self,
        label: &'static str,
        bytes: usize,
        fill: impl FnOnce() -> Vec<u8>,
    ) -> Result<HostBuffer> {
        if bytes > self.limits.max_buffer_length {
            return Err(MatmulError::BufferAllocation { label, bytes });
        }
        let data = fill();
        trace!("host: allocated {} ({} bytes)", label, bytes);

        let mut stats = self.lock_stats();
        stats.allocation_count += 1;
        if self.record {
            stats.allocations.push(Allocation { label, bytes });
        }
        Ok(HostBuffer {
            label,
            data: RefCell::new(data),
        })
    }
}

fn borrow_slots<'b>(
    bindings: &[Binding<'b, HostBuffer>],
) -> Result<Vec<Option<RefMut<'b, Vec<u8>>>>> {
    let width = bindings.iter().map(|b| b.slot + 1).max().unwrap_or(0);
    let mut slots: Vec<Option<RefMut<'b, Vec<u8>>>> = (0..width).map(|_| None).collect();
    for binding in bindings {
        if slots[binding.slot].is_some() {
            return Err(MatmulError::Dispatch(format!(
                "slot {} bound more than once",
                binding.slot
            )));
        }
        let data = binding.buffer.data.try_borrow_mut().map_err(|_| {
            MatmulError::Dispatch(format!(
                "buffer {} is bound to more than one slot",
                binding.buffer.label
            ))
        })?;
        slots[binding.slot] = Some(data);
    }
    Ok(slots)
}

impl ComputeBackend for HostBackend {
    type Library = HostLibrary;
    type Function = HostFunction;
    type Pipeline = HostPipeline;
    type Queue = HostQueue;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "host"
    }

    fn load_library(&self, source: &KernelSource) -> Result<HostLibrary> {
        match source {
            KernelSource::Default => Ok(HostLibrary {
                kernels: BUILTIN_KERNELS,
            }),
            KernelSource::Source(_) => Err(MatmulError::LibraryLoad(
                "the host device cannot compile kernel source".to_string(),
            )),
            KernelSource::File(path) => Err(MatmulError::LibraryLoad(format!(
                "the host device cannot load {}",
                path.display()
            ))),
        }
    }

    fn function(&self, library: &HostLibrary, name: &str) -> Result<HostFunction> {
        library
            .kernels
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(name, kernel)| HostFunction { name, kernel })
            .ok_or_else(|| {
                MatmulError::LibraryLoad(format!("function `{}` not found in library", name))
            })
    }

    fn build_pipeline(&self, function: &HostFunction) -> Result<HostPipeline> {
        let w = self.limits.thread_execution_width;
        let m = self.limits.max_total_threads_per_threadgroup;
        if w == 0 || m < w {
            return Err(MatmulError::PipelineBuild(format!(
                "`{}`: execution width {} does not fit {} threads per threadgroup",
                function.name, w, m
            )));
        }
        Ok(HostPipeline {
            function: *function,
            limits: PipelineLimits {
                thread_execution_width: w,
                max_total_threads_per_threadgroup: m,
            },
        })
    }

    fn pipeline_limits(&self, pipeline: &HostPipeline) -> PipelineLimits {
        pipeline.limits
    }

    fn new_queue(&self) -> Result<HostQueue> {
        let mut stats = self.lock_stats();
        if stats.queues_created >= self.limits.max_command_queues {
            return Err(MatmulError::QueueCreation);
        }
        stats.queues_created += 1;
        Ok(HostQueue {
            id: stats.queues_created,
        })
    }

    fn new_buffer_with_bytes(&self, label: &'static str, bytes: &[u8]) -> Result<HostBuffer> {
        self.allocate(label, bytes.len(), || bytes.to_vec())
    }

    fn new_zeroed_buffer(&self, label: &'static str, len: usize) -> Result<HostBuffer> {
        self.allocate(label, len, || vec![0u8; len])
    }

    fn dispatch(
        &self,
        queue: &HostQueue,
        pipeline: &HostPipeline,
        bindings: &[Binding<'_, HostBuffer>],
        grid: Size3,
        threadgroup: Size3,
    ) -> Result<()> {
        let max_threads = pipeline.limits.max_total_threads_per_threadgroup;
        if threadgroup.volume() == 0 || threadgroup.volume() > max_threads {
            return Err(MatmulError::Dispatch(format!(
                "threadgroup {:?} outside 1..={} threads",
                threadgroup, max_threads
            )));
        }

        let mut guards = borrow_slots(bindings)?;
        let mut args = KernelArgs {
            slots: guards
                .iter_mut()
                .map(|g| g.as_mut().map(|data| data.as_mut_slice()))
                .collect(),
        };

        let groups = grid::threadgroup_count(grid, threadgroup);
        debug!(
            "host queue {}: dispatching `{}` grid={:?} threadgroup={:?} groups={:?}",
            queue.id, pipeline.function.name, grid, threadgroup, groups
        );

        let mut launched = 0usize;
        for gz in 0..groups.depth {
            for gy in 0..groups.height {
                for gx in 0..groups.width {
                    for tz in 0..threadgroup.depth {
                        for ty in 0..threadgroup.height {
                            for tx in 0..threadgroup.width {
                                let gid = ThreadPosition {
                                    x: gx * threadgroup.width + tx,
                                    y: gy * threadgroup.height + ty,
                                    z: gz * threadgroup.depth + tz,
                                };
                                (pipeline.function.kernel)(&mut args, gid).map_err(|e| match e {
                                    MatmulError::Dispatch(_) => e,
                                    other => MatmulError::Dispatch(other.to_string()),
                                })?;
                                launched += 1;
                            }
                        }
                    }
                }
            }
        }

        drop(args);
        drop(guards);

        let mut stats = self.lock_stats();
        stats.dispatch_count += 1;
        if self.record {
            stats.dispatches.push(DispatchRecord {
                function: pipeline.function.name,
                bindings: bindings.iter().map(|b| (b.slot, b.buffer.label)).collect(),
                grid,
                threadgroup,
                threads_launched: launched,
            });
        }
        Ok(())
    }

    fn read_f32(&self, buffer: &HostBuffer, count: usize) -> Result<Vec<f32>> {
        let data = buffer.data.borrow();
        let len = count * ELEMENT_SIZE;
        if len > data.len() {
            return Err(MatmulError::Dispatch(format!(
                "cannot read {} floats from {} byte buffer {}",
                count,
                data.len(),
                buffer.label
            )));
        }
        encoding::floats_from_bytes(&data[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SLOT_A, SLOT_B, SLOT_DESCRIPTOR, SLOT_OUTPUT};
    use crate::descriptor::MatrixDescriptor;

    fn pipeline(backend: &HostBackend) -> HostPipeline {
        let lib = backend.load_library(&KernelSource::Default).unwrap();
        let func = backend.function(&lib, "matmul").unwrap();
        backend.build_pipeline(&func).unwrap()
    }

    fn f32_buffer(backend: &HostBackend, label: &'static str, data: &[f32]) -> HostBuffer {
        backend
            .new_buffer_with_bytes(label, encoding::as_bytes(data))
            .unwrap()
    }

    #[test]
    fn test_library_lookup() {
        let backend = HostBackend::new();
        let lib = backend.load_library(&KernelSource::Default).unwrap();
        assert!(backend.function(&lib, "matmul").is_ok());
        assert!(matches!(
            backend.function(&lib, "conv2d"),
            Err(MatmulError::LibraryLoad(_))
        ));
        assert!(matches!(
            backend.load_library(&KernelSource::Source(String::new())),
            Err(MatmulError::LibraryLoad(_))
        ));
    }

    #[test]
    fn test_pipeline_limits() {
        let backend = HostBackend::with_limits(HostLimits {
            thread_execution_width: 16,
            max_total_threads_per_threadgroup: 256,
            ..HostLimits::default()
        });
        let p = pipeline(&backend);
        assert_eq!(
            backend.pipeline_limits(&p),
            PipelineLimits {
                thread_execution_width: 16,
                max_total_threads_per_threadgroup: 256,
            }
        );
    }

    #[test]
    fn test_pipeline_build_error() {
        let backend = HostBackend::with_limits(HostLimits {
            thread_execution_width: 64,
            max_total_threads_per_threadgroup: 32,
            ..HostLimits::default()
        });
        let lib = backend.load_library(&KernelSource::Default).unwrap();
        let func = backend.function(&lib, "matmul").unwrap();
        assert!(matches!(
            backend.build_pipeline(&func),
            Err(MatmulError::PipelineBuild(_))
        ));
    }

    #[test]
    fn test_queue_limit() {
        let backend = HostBackend::with_limits(HostLimits {
            max_command_queues: 1,
            ..HostLimits::default()
        });
        assert!(backend.new_queue().is_ok());
        assert!(matches!(backend.new_queue(), Err(MatmulError::QueueCreation)));
    }

    #[test]
    fn test_buffer_length_limit() {
        let backend = HostBackend::with_limits(HostLimits {
            max_buffer_length: 8,
            ..HostLimits::default()
        });
        assert_eq!(backend.limits().max_buffer_length, 8);
        assert!(backend.new_zeroed_buffer("output", 8).is_ok());
        assert!(matches!(
            backend.new_zeroed_buffer("output", 9),
            Err(MatmulError::BufferAllocation { label: "output", bytes: 9 })
        ));
        assert!(matches!(
            backend.new_buffer_with_bytes("matrix A", &[0u8; 12]),
            Err(MatmulError::BufferAllocation { label: "matrix A", bytes: 12 })
        ));
        assert_eq!(backend.stats().allocation_count, 1);
    }

    #[test]
    fn test_stats_without_recording_stay_bounded() {
        let backend = HostBackend::new();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();
        let out = backend.new_zeroed_buffer("output", 4).unwrap();
        let desc = MatrixDescriptor::new((1, 1), (1, 1)).unwrap();
        let d = backend.new_buffer_with_bytes("descriptor", &desc.encode()).unwrap();
        for _ in 0..100 {
            let a = f32_buffer(&backend, "matrix A", &[2.0]);
            let b = f32_buffer(&backend, "matrix B", &[3.0]);
            let bindings = [
                Binding { slot: SLOT_A, buffer: &a },
                Binding { slot: SLOT_B, buffer: &b },
                Binding { slot: SLOT_OUTPUT, buffer: &out },
                Binding { slot: SLOT_DESCRIPTOR, buffer: &d },
            ];
            backend
                .dispatch(&queue, &p, &bindings, Size3::new(1, 1, 1), Size3::new(32, 1, 1))
                .unwrap();
        }
        assert_eq!(backend.read_f32(&out, 1).unwrap(), vec![6.0]);

        let stats = backend.stats();
        assert_eq!(stats.allocation_count, 202);
        assert_eq!(stats.dispatch_count, 100);
        assert!(stats.allocations.is_empty());
        assert!(stats.dispatches.is_empty());
    }

    #[test]
    fn test_zeroed_buffer() {
        let backend = HostBackend::new();
        let buf = backend.new_zeroed_buffer("output", 12).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(backend.read_f32(&buf, 3).unwrap(), vec![0.0; 3]);
        assert!(backend.read_f32(&buf, 4).is_err());
    }

    #[test]
    fn test_dispatch_launches_whole_threadgroups() {
        let backend = HostBackend::new().recording();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();

        // [1x2] @ [2x3]
        let a = f32_buffer(&backend, "matrix A", &[1.0, 2.0]);
        let b = f32_buffer(&backend, "matrix B", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = backend.new_zeroed_buffer("output", 12).unwrap();
        let desc = MatrixDescriptor::new((1, 2), (2, 3)).unwrap();
        let d = backend.new_buffer_with_bytes("descriptor", &desc.encode()).unwrap();

        let bindings = [
            Binding { slot: SLOT_A, buffer: &a },
            Binding { slot: SLOT_B, buffer: &b },
            Binding { slot: SLOT_OUTPUT, buffer: &out },
            Binding { slot: SLOT_DESCRIPTOR, buffer: &d },
        ];
        backend
            .dispatch(&queue, &p, &bindings, Size3::new(3, 1, 1), Size3::new(32, 2, 1))
            .unwrap();

        assert_eq!(backend.read_f32(&out, 3).unwrap(), vec![9.0, 12.0, 15.0]);
        let stats = backend.stats();
        let record = stats.dispatches.last().unwrap();
        assert_eq!(record.threads_launched, 64);
        assert_eq!(record.function, "matmul");
    }

    #[test]
    fn test_dispatch_out_of_bounds_write() {
        let backend = HostBackend::new();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();

        let a = f32_buffer(&backend, "matrix A", &[1.0; 4]);
        let b = f32_buffer(&backend, "matrix B", &[1.0; 4]);
        // Output one element short of 2x2.
        let out = backend.new_zeroed_buffer("output", 12).unwrap();
        let desc = MatrixDescriptor::new((2, 2), (2, 2)).unwrap();
        let d = backend.new_buffer_with_bytes("descriptor", &desc.encode()).unwrap();

        let bindings = [
            Binding { slot: SLOT_A, buffer: &a },
            Binding { slot: SLOT_B, buffer: &b },
            Binding { slot: SLOT_OUTPUT, buffer: &out },
            Binding { slot: SLOT_DESCRIPTOR, buffer: &d },
        ];
        let err = backend
            .dispatch(&queue, &p, &bindings, Size3::new(2, 2, 1), Size3::new(32, 1, 1))
            .unwrap_err();
        assert!(matches!(err, MatmulError::Dispatch(_)));
        assert_eq!(backend.stats().dispatch_count, 0);
    }

    #[test]
    fn test_dispatch_missing_descriptor() {
        let backend = HostBackend::new();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();
        let a = f32_buffer(&backend, "matrix A", &[1.0]);
        let err = backend
            .dispatch(
                &queue,
                &p,
                &[Binding { slot: SLOT_A, buffer: &a }],
                Size3::new(1, 1, 1),
                Size3::new(32, 1, 1),
            )
            .unwrap_err();
        assert!(err.to_string().contains("slot 3"));
    }

    #[test]
    fn test_dispatch_same_buffer_twice() {
        let backend = HostBackend::new();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();
        let a = f32_buffer(&backend, "matrix A", &[1.0]);
        let bindings = [
            Binding { slot: SLOT_A, buffer: &a },
            Binding { slot: SLOT_B, buffer: &a },
        ];
        assert!(backend
            .dispatch(&queue, &p, &bindings, Size3::new(1, 1, 1), Size3::new(32, 1, 1))
            .is_err());
    }

    #[test]
    fn test_dispatch_oversized_threadgroup() {
        let backend = HostBackend::new();
        let p = pipeline(&backend);
        let queue = backend.new_queue().unwrap();
        assert!(backend
            .dispatch(&queue, &p, &[], Size3::new(1, 1, 1), Size3::new(64, 32, 1))
            .is_err());
    }
}
