//! SIMD helpers for tile multiply-accumulate

pub mod dot_f32;

/// f32 dot product, AVX2+FMA when the CPU has it, scalar otherwise.
#[inline]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            // SAFETY: features checked above; both slices hold at least `len` elements.
            return unsafe { dot_f32::dot_f32_avx2_fma(a.as_ptr(), b.as_ptr(), len) };
        }
    }

    dot_f32::dot_f32_scalar(&a[..len], &b[..len])
}
