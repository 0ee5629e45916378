//! Thread-grid and threadgroup sizing for one output-per-thread dispatch.

use crate::backend::PipelineLimits;
use crate::config::ThreadgroupPolicy;
use crate::descriptor::MatrixDescriptor;
use crate::error::{MatmulError, Result};

/// A three-dimensional extent, in threads or threadgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size3 {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Size3 {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Size3 {
            width,
            height,
            depth,
        }
    }

    /// `width * height * depth`.
    pub fn volume(&self) -> usize {
        self.width * self.height * self.depth
    }
}

/// Grid with one thread per output cell: `x` walks output columns, `y`
/// walks output rows.
pub fn output_grid(desc: &MatrixDescriptor) -> Size3 {
    Size3::new(desc.output_cols(), desc.output_rows(), 1)
}

/// Pick threadgroup dimensions for a pipeline.
///
/// `Auto` yields `(w, m / w, 1)` for execution width `w` and max threads
/// `m`. `Fixed` sizes are checked against the same limits: the width must
/// be a multiple of `w` and the area must not exceed `m`.
pub fn threadgroup_size(limits: &PipelineLimits, policy: &ThreadgroupPolicy) -> Result<Size3> {
    let w = limits.thread_execution_width;
    let m = limits.max_total_threads_per_threadgroup;
    if w == 0 || m < w {
        return Err(MatmulError::Dispatch(format!(
            "unusable pipeline limits: execution width {}, max threads {}",
            w, m
        )));
    }

    let size = match *policy {
        ThreadgroupPolicy::Auto => Size3::new(w, m / w, 1),
        ThreadgroupPolicy::Fixed { width, height } => Size3::new(width, height, 1),
    };

    if size.width == 0 || size.height == 0 {
        return Err(MatmulError::Dispatch(format!(
            "threadgroup {}x{} has a zero dimension",
            size.width, size.height
        )));
    }
    if size.width % w != 0 {
        return Err(MatmulError::Dispatch(format!(
            "threadgroup width {} is not a multiple of execution width {}",
            size.width, w
        )));
    }
    if size.volume() > m {
        return Err(MatmulError::Dispatch(format!(
            "threadgroup {}x{} exceeds {} threads",
            size.width, size.height, m
        )));
    }
    Ok(size)
}

fn groups_along(threads: usize, group: usize) -> usize {
    if threads == 0 {
        0
    } else {
        threads.div_ceil(group)
    }
}

/// Number of whole threadgroups needed to cover `grid`.
pub fn threadgroup_count(grid: Size3, threadgroup: Size3) -> Size3 {
    Size3::new(
        groups_along(grid.width, threadgroup.width),
        groups_along(grid.height, threadgroup.height),
        groups_along(grid.depth, threadgroup.depth),
    )
}
