// Pure ALU and FPU semantics shared by both execution engines.
//
// Every helper takes plain values and returns the result (and T where the
// instruction defines one); register plumbing stays in the executor.

#[inline(always)]
pub fn sh4_addc(t: bool, n: u32, m: u32) -> (u32, bool) {
    let tmp1 = n.wrapping_add(m);
    let dst = tmp1.wrapping_add(t as u32);
    (dst, n > tmp1 || tmp1 > dst)
}

#[inline(always)]
pub fn sh4_addv(n: u32, m: u32) -> (u32, bool) {
    let (dst, overflow) = (n as i32).overflowing_add(m as i32);
    (dst as u32, overflow)
}

#[inline(always)]
pub fn sh4_subc(t: bool, n: u32, m: u32) -> (u32, bool) {
    let tmp1 = n.wrapping_sub(m);
    let dst = tmp1.wrapping_sub(t as u32);
    (dst, n < tmp1 || tmp1 < dst)
}

#[inline(always)]
pub fn sh4_subv(n: u32, m: u32) -> (u32, bool) {
    let (dst, overflow) = (n as i32).overflowing_sub(m as i32);
    (dst as u32, overflow)
}

#[inline(always)]
pub fn sh4_negc(t: bool, m: u32) -> (u32, bool) {
    let tmp = 0u32.wrapping_sub(m);
    let dst = tmp.wrapping_sub(t as u32);
    (dst, tmp > 0 || tmp < dst)
}

/// Returns `(q, m, t)`.
#[inline(always)]
pub fn sh4_div0s(n: u32, m: u32) -> (bool, bool, bool) {
    let q = n >> 31 != 0;
    let m = m >> 31 != 0;
    (q, m, q ^ m)
}

/// One non-restoring division step. Returns `(rn, q, t)`. When Rm is Rn
/// itself the divisor is the already shifted value.
pub fn sh4_div1(q: bool, m: bool, t: bool, rn: u32, rm: u32, rm_is_rn: bool) -> (u32, bool, bool) {
    let old_q = q;
    let mut q = rn >> 31 != 0;
    let mut rn = (rn << 1) | t as u32;
    let tmp0 = rn;
    let rm = if rm_is_rn { rn } else { rm };

    let tmp1 = if old_q == m {
        rn = rn.wrapping_sub(rm);
        rn > tmp0
    } else {
        rn = rn.wrapping_add(rm);
        rn < tmp0
    };

    q = if m { !(q ^ tmp1) } else { q ^ tmp1 };

    (rn, q, q == m)
}

#[inline(always)]
pub fn sh4_cmp_str(n: u32, m: u32) -> bool {
    let temp = n ^ m;
    (temp & 0xFF00_0000) == 0
        || (temp & 0x00FF_0000) == 0
        || (temp & 0x0000_FF00) == 0
        || (temp & 0x0000_00FF) == 0
}

#[inline(always)]
pub fn sh4_shad(n: u32, m: u32) -> u32 {
    if m & 0x8000_0000 == 0 {
        n << (m & 0x1F)
    } else if m & 0x1F == 0 {
        ((n as i32) >> 31) as u32
    } else {
        ((n as i32) >> ((!m & 0x1F) + 1)) as u32
    }
}

#[inline(always)]
pub fn sh4_shld(n: u32, m: u32) -> u32 {
    if m & 0x8000_0000 == 0 {
        n << (m & 0x1F)
    } else if m & 0x1F == 0 {
        0
    } else {
        n >> ((!m & 0x1F) + 1)
    }
}

#[inline(always)]
pub fn sh4_dmulu(n: u32, m: u32) -> u64 {
    n as u64 * m as u64
}

#[inline(always)]
pub fn sh4_dmuls(n: u32, m: u32) -> u64 {
    (n as i32 as i64 * m as i32 as i64) as u64
}

#[inline(always)]
pub fn sh4_muluw(n: u32, m: u32) -> u32 {
    (n as u16 as u32) * (m as u16 as u32)
}

#[inline(always)]
pub fn sh4_mulsw(n: u32, m: u32) -> u32 {
    (n as i16 as i32).wrapping_mul(m as i16 as i32) as u32
}

/// `mac.w`. With S set only MACL accumulates, saturating to 32 bits and
/// flagging overflow in MACH bit 0.
pub fn sh4_mac_w(mac: u64, s: bool, rn: u16, rm: u16) -> u64 {
    let mul = rn as i16 as i64 * rm as i16 as i64;
    if !s {
        return (mac as i64).wrapping_add(mul) as u64;
    }
    let macl = mac as u32 as i32 as i64;
    let sum = macl + mul;
    let mach = (mac >> 32) as u32;
    if sum > i32::MAX as i64 {
        ((mach as u64 | 1) << 32) | 0x7FFF_FFFF
    } else if sum < i32::MIN as i64 {
        ((mach as u64 | 1) << 32) | 0x8000_0000
    } else {
        ((mach as u64) << 32) | (sum as u32 as u64)
    }
}

const MAC48_MAX: i64 = 0x0000_7FFF_FFFF_FFFF;
const MAC48_MIN: i64 = -0x0000_8000_0000_0000;

/// `mac.l`. With S set the sum saturates to 48 bits.
pub fn sh4_mac_l(mac: u64, s: bool, rn: u32, rm: u32) -> u64 {
    let mul = rn as i32 as i64 * rm as i32 as i64;
    if !s {
        return (mac as i64).wrapping_add(mul) as u64;
    }
    // Sign-extend the 48-bit accumulator.
    let acc = ((mac << 16) as i64) >> 16;
    let sum = acc.saturating_add(mul).clamp(MAC48_MIN, MAC48_MAX);
    let high = if sum < 0 { 0xFFFF_0000_0000_0000 } else { 0 };
    (sum as u64 & 0x0000_FFFF_FFFF_FFFF) | high
}

#[inline(always)]
pub fn sh4_swapb(m: u32) -> u32 {
    (m & 0xFFFF_0000) | ((m & 0xFF) << 8) | ((m >> 8) & 0xFF)
}

#[inline(always)]
pub fn sh4_swapw(m: u32) -> u32 {
    m.rotate_left(16)
}

#[inline(always)]
pub fn sh4_xtrct(n: u32, m: u32) -> u32 {
    (n >> 16) | (m << 16)
}

#[inline(always)]
pub fn sh4_rotcl(t: bool, n: u32) -> (u32, bool) {
    ((n << 1) | t as u32, n & 0x8000_0000 != 0)
}

#[inline(always)]
pub fn sh4_rotcr(t: bool, n: u32) -> (u32, bool) {
    ((n >> 1) | ((t as u32) << 31), n & 1 != 0)
}

// ---------------------------------------------------------------------------
// FPU
// ---------------------------------------------------------------------------

#[inline(always)]
pub fn sh4_fsca(index: u32) -> (f32, f32) {
    let pi_index = index & 0xFFFF;
    // rads = (index / (65536/2)) * pi
    let rads = (pi_index as f32) / (65536.0f32 / 2.0f32) * std::f32::consts::PI;
    (rads.sin(), rads.cos())
}

/// Truncates with saturation. NaN reads as 0x80000000, anything at or
/// above 2^31 (infinity included) as 0x7FFFFFFF.
#[inline(always)]
pub fn sh4_ftrc(val: f32) -> u32 {
    if val.is_nan() {
        0x8000_0000
    } else if val >= 2147483648.0 {
        0x7FFF_FFFF
    } else if val < -2147483648.0 {
        0x8000_0000
    } else {
        val as i32 as u32
    }
}

#[inline(always)]
pub fn sh4_ftrc_d(val: f64) -> u32 {
    if val.is_nan() {
        0x8000_0000
    } else if val >= 2147483648.0 {
        0x7FFF_FFFF
    } else if val < -2147483648.0 {
        0x8000_0000
    } else {
        val as i32 as u32
    }
}

#[inline(always)]
pub fn sh4_fsrra(val: f32) -> f32 {
    1.0 / val.sqrt()
}

#[inline(always)]
pub fn sh4_fipr(v1: [f32; 4], v2: [f32; 4]) -> f32 {
    v1[0] * v2[0] + v1[1] * v2[1] + v1[2] * v2[2] + v1[3] * v2[3]
}

#[inline(always)]
pub fn sh4_fmac(fr0: f32, m: f32, n: f32) -> f32 {
    (n as f64 + fr0 as f64 * m as f64) as f32
}

/// `XMTRX * FVn`, the matrix stored column-major in XF0-XF15.
pub fn sh4_ftrv(xf: &[f32; 16], v: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0f32; 4];
    for (row, slot) in out.iter_mut().enumerate() {
        *slot = xf[row] * v[0] + xf[row + 4] * v[1] + xf[row + 8] * v[2] + xf[row + 12] * v[3];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addc_chains_carry() {
        assert_eq!(sh4_addc(false, 0xFFFF_FFFF, 1), (0, true));
        assert_eq!(sh4_addc(true, 0xFFFF_FFFF, 0), (0, true));
        assert_eq!(sh4_addc(true, 1, 1), (3, false));
        // 64-bit add from two halves.
        let (lo, c) = sh4_addc(false, 0x8000_0000, 0x8000_0000);
        let (hi, c) = sh4_addc(c, 1, 2);
        assert_eq!((hi, lo, c), (4, 0, false));
    }

    #[test]
    fn subc_and_negc_borrow() {
        assert_eq!(sh4_subc(false, 0, 1), (0xFFFF_FFFF, true));
        assert_eq!(sh4_subc(true, 1, 0), (0, false));
        assert_eq!(sh4_subc(true, 0, 0), (0xFFFF_FFFF, true));
        assert_eq!(sh4_negc(false, 0), (0, false));
        assert_eq!(sh4_negc(false, 1), (0xFFFF_FFFF, true));
        assert_eq!(sh4_negc(true, 0), (0xFFFF_FFFF, true));
    }

    #[test]
    fn addv_subv_overflow() {
        assert_eq!(sh4_addv(0x7FFF_FFFF, 1), (0x8000_0000, true));
        assert_eq!(sh4_addv(0xFFFF_FFFF, 1), (0, false));
        assert_eq!(sh4_subv(0x8000_0000, 1), (0x7FFF_FFFF, true));
        assert_eq!(sh4_subv(5, 3), (2, false));
    }

    #[test]
    fn div1_divides() {
        // 32/16 unsigned division: 100 / 7.
        let divisor = 7u32 << 16;
        let mut rn = 100u32;
        let (mut q, m, mut t) = (false, false, false);
        for _ in 0..16 {
            let (r, nq, nt) = sh4_div1(q, m, t, rn, divisor, false);
            rn = r;
            q = nq;
            t = nt;
        }
        let (quot, _) = sh4_rotcl(t, rn);
        assert_eq!(quot & 0xFFFF, 14);
    }

    #[test]
    fn shifts() {
        assert_eq!(sh4_shad(0x8000_0000, (-31i32) as u32), 0xFFFF_FFFF);
        assert_eq!(sh4_shad(0x8000_0000, 0x8000_0000), 0xFFFF_FFFF);
        assert_eq!(sh4_shld(0x8000_0000, (-31i32) as u32), 1);
        assert_eq!(sh4_shld(0x8000_0000, 0x8000_0000), 0);
        assert_eq!(sh4_shad(1, 4), 16);
    }

    #[test]
    fn mac_saturates() {
        let sat = sh4_mac_w(0x7FFF_FFF0, true, 0x7FFF, 0x7FFF);
        assert_eq!(sat as u32, 0x7FFF_FFFF);
        assert_eq!(sat >> 32 & 1, 1);
        let plain = sh4_mac_w(0, false, 0xFFFF, 2);
        assert_eq!(plain, (-2i64) as u64);

        let sat = sh4_mac_l(0x0000_7FFF_FFFF_FFF0, true, 0x10, 0x10);
        assert_eq!(sat, 0x0000_7FFF_FFFF_FFFF);
        let neg = sh4_mac_l(0, true, (-4i32) as u32, 4);
        assert_eq!(neg, (-16i64) as u64);
        let wrap = sh4_mac_l(u64::MAX, false, 1, 1);
        assert_eq!(wrap, 0);
    }

    #[test]
    fn ftrc_saturates() {
        assert_eq!(sh4_ftrc(3.9), 3);
        assert_eq!(sh4_ftrc(-3.9), (-3i32) as u32);
        assert_eq!(sh4_ftrc(2147483520.0), 0x7FFF_FF80);
        assert_eq!(sh4_ftrc(3.0e9), 0x7FFF_FFFF);
        assert_eq!(sh4_ftrc(f32::INFINITY), 0x7FFF_FFFF);
        assert_eq!(sh4_ftrc(f32::NEG_INFINITY), 0x8000_0000);
        assert_eq!(sh4_ftrc(f32::NAN), 0x8000_0000);
        assert_eq!(sh4_ftrc_d(1e12), 0x7FFF_FFFF);
        assert_eq!(sh4_ftrc_d(f64::NAN), 0x8000_0000);
    }

    #[test]
    fn vector_ops() {
        assert_eq!(sh4_fipr([1.0, 2.0, 3.0, 4.0], [1.0, 1.0, 1.0, 1.0]), 10.0);
        let mut identity = [0.0f32; 16];
        for i in 0..4 {
            identity[i * 5] = 1.0;
        }
        assert_eq!(sh4_ftrv(&identity, [1.0, 2.0, 3.0, 4.0]), [1.0, 2.0, 3.0, 4.0]);
        let (s, c) = sh4_fsca(0x4000);
        assert!((s - 1.0).abs() < 1e-6 && c.abs() < 1e-6);
    }
}
