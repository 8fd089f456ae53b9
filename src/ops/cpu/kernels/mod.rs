//! CPU compute kernels shared by the tiled attention backward.

pub mod simd;
