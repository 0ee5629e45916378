use std::fmt;

use thiserror::Error;

/// Which input of a multiplication an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    A,
    B,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::A => write!(f, "A"),
            Operand::B => write!(f, "B"),
        }
    }
}

/// The pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    Device,
    Library,
    Pipeline,
    Queue,
    Staging,
    Dispatch,
}

#[derive(Error, Debug)]
pub enum MatmulError {
    #[error("matrix {operand} is empty ({rows}x{cols})")]
    EmptyMatrix {
        operand: Operand,
        rows: usize,
        cols: usize,
    },
    #[error("matmul dimension mismatch: [{a_rows}x{a_cols}] @ [{b_rows}x{b_cols}]")]
    DimensionMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },
    #[error("row {row} has {got} columns, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("data length {len} does not match shape {rows}x{cols}")]
    ShapeMismatch { rows: usize, cols: usize, len: usize },
    #[error("dimension {0} does not fit in a 32-bit descriptor field")]
    DimensionOverflow(usize),
    #[error("invalid matrix descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no compute device available")]
    DeviceUnavailable,
    #[error("failed to load kernel library: {0}")]
    LibraryLoad(String),
    #[error("failed to build compute pipeline: {0}")]
    PipelineBuild(String),
    #[error("failed to create command queue")]
    QueueCreation,
    #[error("failed to allocate {bytes} byte buffer for {label}")]
    BufferAllocation { label: &'static str, bytes: usize },
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl MatmulError {
    /// Returns the stage of the pipeline that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            MatmulError::EmptyMatrix { .. }
            | MatmulError::DimensionMismatch { .. }
            | MatmulError::RaggedRows { .. }
            | MatmulError::ShapeMismatch { .. }
            | MatmulError::DimensionOverflow(_)
            | MatmulError::InvalidDescriptor(_) => Stage::Validation,
            MatmulError::DeviceUnavailable => Stage::Device,
            MatmulError::LibraryLoad(_) => Stage::Library,
            MatmulError::PipelineBuild(_) => Stage::Pipeline,
            MatmulError::QueueCreation => Stage::Queue,
            MatmulError::BufferAllocation { .. } => Stage::Staging,
            MatmulError::Dispatch(_) => Stage::Dispatch,
        }
    }
}

pub type Result<T> = std::result::Result<T, MatmulError>;
