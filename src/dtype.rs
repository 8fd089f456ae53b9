//! Storage element types.
//!
//! Tensors are stored as `f32`, `f16` or `bf16`; every tile is widened to
//! `f32` when it is staged, so accumulation never happens in storage precision.

use half::{bf16, f16};

/// A storage element the backward kernel can read and write.
pub trait Element: Copy + Send + Sync + Default + PartialEq + std::fmt::Debug + 'static {
    /// Short name used in logs and error messages.
    const NAME: &'static str;

    /// Whether the type is a 16-bit float.
    const IS_HALF: bool;

    /// Elements per 128-bit vector access. Strides must be multiples of
    /// this in aligned mode.
    const VECTOR_WIDTH: usize;

    /// Widen to `f32`.
    fn to_f32(self) -> f32;

    /// Narrow from `f32` (round to nearest).
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const NAME: &'static str = "f32";
    const IS_HALF: bool = false;
    const VECTOR_WIDTH: usize = 4;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    const NAME: &'static str = "f16";
    const IS_HALF: bool = true;
    const VECTOR_WIDTH: usize = 8;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    const NAME: &'static str = "bf16";
    const IS_HALF: bool = true;
    const VECTOR_WIDTH: usize = 8;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// Convert a slice of `f32` into storage elements.
pub fn cast_slice_from_f32<T: Element>(src: &[f32]) -> Vec<T> {
    src.iter().map(|&v| T::from_f32(v)).collect()
}

/// Widen a slice of storage elements to `f32`.
pub fn cast_slice_to_f32<T: Element>(src: &[T]) -> Vec<f32> {
    src.iter().map(|v| v.to_f32()).collect()
}
