//! `mm-gpu` - Dense matrix multiplication dispatched to a GPU compute pipeline.
//!
//! This crate provides:
//! - A row-major `Matrix` type and the flatten/reshape transforms around it
//! - The 16-byte `MatrixDescriptor` wire format read by the kernel
//! - A `ComputeBackend` trait for compute devices (Metal, host reference)
//! - Grid and threadgroup sizing for one-thread-per-output dispatch
//! - A reusable `MatmulContext` and the one-shot `multiply` entry point

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod grid;
pub mod host;
pub mod matrix;
#[cfg(all(feature = "metal", target_os = "macos"))]
pub mod metal;
pub mod staging;

// Re-export primary types at the crate root for convenience.
pub use backend::{ComputeBackend, DeviceBuffer, PipelineLimits};
pub use config::{KernelSource, MatmulConfig, ThreadgroupPolicy};
pub use descriptor::MatrixDescriptor;
pub use dispatch::{default_backend, default_context, multiply, DefaultBackend, MatmulContext};
pub use error::{MatmulError, Operand, Result, Stage};
pub use grid::Size3;
pub use host::HostBackend;
pub use matrix::Matrix;
#[cfg(all(feature = "metal", target_os = "macos"))]
pub use metal::MetalBackend;
