//! Metal Shading Language source of the built-in matmul kernel.

/// One thread per output cell of `C = A @ B`.
///
/// Buffers: A at 0, B at 1, C at 2, the 16-byte descriptor at 3.
/// `thread_position_in_grid.x` is the output column and `.y` the output row.
/// Threads past the output edge return immediately, so the kernel is safe
/// under both `dispatchThreads` and whole-threadgroup dispatch.
pub const MATMUL_MSL: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct MatrixDescriptor {
    int a_rows;
    int a_cols;
    int b_rows;
    int b_cols;
};

kernel void matmul(
    device const float* a [[buffer(0)]],
    device const float* b [[buffer(1)]],
    device float* c [[buffer(2)]],
    constant MatrixDescriptor& desc [[buffer(3)]],
    uint2 gid [[thread_position_in_grid]])
{
    uint row = gid.y;
    uint col = gid.x;
    if (row >= uint(desc.a_rows) || col >= uint(desc.b_cols)) {
        return;
    }

    uint k = uint(desc.a_cols);
    uint n = uint(desc.b_cols);
    float sum = 0.0f;
    for (uint p = 0; p < k; p++) {
        sum += a[row * k + p] * b[p * n + col];
    }
    c[row * n + col] = sum;
}
"#;
