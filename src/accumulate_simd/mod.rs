//! SIMD-accelerated 3-level collapse dispatch for multiple architectures.
//!
//! Every kernel performs the exact pairing `((a0+a1)+(a2+a3)) +
//! ((a4+a5)+(a6+a7))` per block of 8 doubles; the scalar fallback in the
//! caller is bit-equivalent.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
mod aarch64;

/// Try to collapse `blocks` runs of 8 consecutive doubles into one sum each.
/// Returns `true` if a SIMD path handled the work.
///
/// # Safety
/// `src` must be valid for `blocks * 8` reads and `dst` for `blocks`
/// writes. `dst` may alias the front of `src`: block `i` writes `dst[i]`
/// only after reading `src[8i..8i+8]`, and `i <= 8i` for all `i`.
pub(crate) unsafe fn collapse_blocks_simd(src: *const f64, dst: *mut f64, blocks: usize) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            unsafe { x86_64::collapse_blocks_avx2(src, dst, blocks) };
            return true;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        unsafe { aarch64::collapse_blocks_neon(src, dst, blocks) };
        return true;
    }
    #[allow(unreachable_code)]
    {
        let _ = (src, dst, blocks);
        false
    }
}
