//! NEON collapse kernel for aarch64.

use std::arch::aarch64::*;

/// Pairwise-add collapse of 8 doubles per block, matching the scalar
/// pairing exactly: `vpaddq_f64` adds adjacent lanes, so two rounds leave
/// `[(a0+a1)+(a2+a3), (a4+a5)+(a6+a7)]` and the across-vector add joins
/// them.
///
/// # Safety
/// Pointer contract of [`super::collapse_blocks_simd`].
pub(crate) unsafe fn collapse_blocks_neon(src: *const f64, dst: *mut f64, blocks: usize) {
    unsafe {
        for i in 0..blocks {
            let p = src.add(i * 8);
            let q0 = vld1q_f64(p);
            let q1 = vld1q_f64(p.add(2));
            let q2 = vld1q_f64(p.add(4));
            let q3 = vld1q_f64(p.add(6));

            let level1_lo = vpaddq_f64(q0, q1);
            let level1_hi = vpaddq_f64(q2, q3);
            let level2 = vpaddq_f64(level1_lo, level1_hi);

            *dst.add(i) = vaddvq_f64(level2);
        }
    }
}
