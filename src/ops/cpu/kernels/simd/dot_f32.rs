//! f32 dot products for the packed tile multiply.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Reduce the 8 lanes of an AVX register to one f32.
///
/// # Safety
/// - CPU must support AVX2 (enforced by `#[target_feature]` at call site)
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn reduce_lanes(v: __m256) -> f32 {
    // Register-only shuffles; no memory is touched.
    let folded = _mm_add_ps(_mm256_castps256_ps128(v), _mm256_extractf128_ps(v, 1));
    let pairs = _mm_add_ps(folded, _mm_movehl_ps(folded, folded));
    let single = _mm_add_ss(pairs, _mm_shuffle_ps(pairs, pairs, 0b_00_00_00_01));
    _mm_cvtss_f32(single)
}

/// Dot product of two f32 runs with FMA, two independent accumulators.
///
/// # Safety
/// - CPU must support AVX2 + FMA (enforced by `#[target_feature]` at call site)
/// - `a` and `b` must be valid for reads of `len` f32 elements each
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dot_f32_avx2_fma(a: *const f32, b: *const f32, len: usize) -> f32 {
    // SAFETY: every offset below is < len; unaligned loads are used throughout.
    unsafe {
        const LANES: usize = 8;
        let pairs = len / (2 * LANES);
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();

        for i in 0..pairs {
            let o = i * 2 * LANES;
            acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(a.add(o)), _mm256_loadu_ps(b.add(o)), acc0);
            acc1 = _mm256_fmadd_ps(
                _mm256_loadu_ps(a.add(o + LANES)),
                _mm256_loadu_ps(b.add(o + LANES)),
                acc1,
            );
        }

        let mut done = pairs * 2 * LANES;
        if len - done >= LANES {
            acc0 = _mm256_fmadd_ps(
                _mm256_loadu_ps(a.add(done)),
                _mm256_loadu_ps(b.add(done)),
                acc0,
            );
            done += LANES;
        }

        let mut sum = reduce_lanes(_mm256_add_ps(acc0, acc1));
        for i in done..len {
            sum += *a.add(i) * *b.add(i);
        }
        sum
    }
}

/// Portable fallback.
#[inline]
pub fn dot_f32_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |s, (&x, &y)| s + x * y)
}
