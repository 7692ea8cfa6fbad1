//! AVX2 collapse kernel for x86_64.

use std::arch::x86_64::*;

/// Horizontal-add collapse of 8 doubles per block.
///
/// `_mm256_hadd_pd(a, b)` yields `[a0+a1, b0+b1, a2+a3, b2+b3]`; adding the
/// upper and lower 128-bit halves pairs `(a0+a1)+(a2+a3)` and
/// `(b0+b1)+(b2+b3)`, and the final horizontal add joins the two. Identical
/// pairing to the scalar path.
///
/// # Safety
/// Caller guarantees AVX2 plus the pointer contract of
/// [`super::collapse_blocks_simd`].
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn collapse_blocks_avx2(src: *const f64, dst: *mut f64, blocks: usize) {
    unsafe {
        for i in 0..blocks {
            let p = src.add(i * 8);
            let a = _mm256_loadu_pd(p);
            let b = _mm256_loadu_pd(p.add(4));
            let level1 = _mm256_hadd_pd(a, b);

            let hi = _mm256_extractf128_pd::<1>(level1);
            let lo = _mm256_castpd256_pd128(level1);
            let level2 = _mm_add_pd(hi, lo);

            let level3 = _mm_hadd_pd(level2, level2);
            *dst.add(i) = _mm_cvtsd_f64(level3);
        }
    }
}
