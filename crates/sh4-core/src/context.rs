//! Guest CPU register file.
//!
//! The context is `#[repr(C)]` with a fixed layout because generated code
//! addresses it relative to the guest memory base: it is placed so that it
//! ends exactly where guest memory begins, and every field has a constant
//! negative displacement from that base.

use std::mem::{offset_of, size_of};

use bitfield::bitfield;
use seq_macro::seq;

#[repr(C)]
#[derive(Clone, Copy)]
pub union FRBank {
    pub f32s: [f32; 16],
    pub u32s: [u32; 16],
    pub u64s: [u64; 8],
    pub f64s: [f64; 8],
}

impl Default for FRBank {
    fn default() -> Self {
        FRBank { u32s: [0; 16] }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union MacReg {
    pub full: u64,
    pub parts: MacRegParts,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MacRegParts {
    pub l: u32,
    pub h: u32,
}

impl Default for MacReg {
    fn default() -> Self {
        MacReg { full: 0 }
    }
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct SrStatus(u32);
    impl Debug;

    pub u32, full, set_full: 31, 0;
    pub t, set_t: 0;
    pub s, set_s: 1;
    // bits 2-3 reserved
    pub u32, imask, set_imask: 7, 4;
    pub q, set_q: 8;
    pub m, set_m: 9;
    // bits 10-14 reserved
    pub fd, set_fd: 15;
    // bits 16-27 reserved
    pub bl, set_bl: 28;
    pub rb, set_rb: 29;
    pub md, set_md: 30;
    // bit 31 reserved
}

bitfield! {
    #[repr(C)]
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct FpscrReg(u32);
    impl Debug;

    pub u32, full, set_full: 31, 0;
    pub u32, rm, set_rm: 1, 0;
    pub finexact, set_finexact: 2;
    pub funderflow, set_funderflow: 3;
    pub foverflow, set_foverflow: 4;
    pub fdivbyzero, set_fdivbyzero: 5;
    pub finvalidop, set_finvalidop: 6;
    pub einexact, set_einexact: 7;
    pub eunderflow, set_eunderflow: 8;
    pub eoverflow, set_eoverflow: 9;
    pub edivbyzero, set_edivbyzero: 10;
    pub einvalidop, set_einvalidop: 11;
    pub cinexact, set_cinexact: 12;
    pub cunderflow, set_cunderflow: 13;
    pub coverflow, set_coverflow: 14;
    pub cdivbyzero, set_cdivbyzero: 15;
    pub cinvalid, set_cinvalid: 16;
    pub cfpuerr, set_cfpuerr: 17;
    pub dn, set_dn: 18;
    pub pr, set_pr: 19;
    pub sz, set_sz: 20;
    pub fr, set_fr: 21;
    // bits 22-31 reserved
}

/// Writable SR bits. T lives in `sr_t`, the rest read as zero.
pub const SR_MASK: u32 = 0x7000_83F2;
pub const FPSCR_MASK: u32 = 0x003F_FFFF;

pub const RESET_VBR: u32 = 0;
pub const RESET_PC: u32 = 0xA000_0000;
pub const RESET_SR: u32 = 0x7000_00F0;
pub const RESET_FPSCR: u32 = 0x0004_0001;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Sh4Context {
    pub r: [u32; 16],
    pub r_bank: [u32; 8],

    pub fr: FRBank,
    pub xf: FRBank,

    pub mac: MacReg,

    pub sr_t: u32,
    pub sr: SrStatus,
    pub fpscr: FpscrReg,
    pub fpul: u32,

    pub gbr: u32,
    pub vbr: u32,
    pub ssr: u32,
    pub spc: u32,
    pub sgr: u32,
    pub dbr: u32,
    pub pr: u32,
    pub pc: u32,
}

const _: () = assert!(size_of::<Sh4Context>() == 280);
const _: () = assert!(align_of::<Sh4Context>() == 8);

// Every field is plain data and the layout has no padding (checked above).
unsafe impl bytemuck::Zeroable for Sh4Context {}
unsafe impl bytemuck::Pod for Sh4Context {}

macro_rules! register_offsets {
    ($($field:ident),* $(,)?) => {
        paste::paste! {
            impl Sh4Context {
                $(
                    pub const [<$field:upper _OFFSET>]: usize = offset_of!(Sh4Context, $field);
                    /// Displacement from the guest memory base.
                    pub const [<$field:upper _REL>]: isize =
                        offset_of!(Sh4Context, $field) as isize - size_of::<Sh4Context>() as isize;
                )*
            }
        }
    };
}

register_offsets!(
    r, r_bank, fr, xf, mac, sr_t, sr, fpscr, fpul, gbr, vbr, ssr, spc, sgr, dbr, pr, pc,
);

impl Sh4Context {
    pub const SIZE: usize = size_of::<Sh4Context>();

    pub const R_OFFSETS: [usize; 16] =
        seq!(N in 0..16 { [#(Sh4Context::R_OFFSET + N * 4,)*] });
    pub const R_BANK_OFFSETS: [usize; 8] =
        seq!(N in 0..8 { [#(Sh4Context::R_BANK_OFFSET + N * 4,)*] });
    pub const FR_OFFSETS: [usize; 16] =
        seq!(N in 0..16 { [#(Sh4Context::FR_OFFSET + N * 4,)*] });
    pub const XF_OFFSETS: [usize; 16] =
        seq!(N in 0..16 { [#(Sh4Context::XF_OFFSET + N * 4,)*] });
    pub const MACL_OFFSET: usize = Sh4Context::MAC_OFFSET;
    pub const MACH_OFFSET: usize = Sh4Context::MAC_OFFSET + 4;

    /// Base-relative displacement of `R[n]`.
    pub const fn r_rel(n: usize) -> isize {
        Self::R_OFFSETS[n] as isize - Self::SIZE as isize
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Architectural reset. Hard resets also clear every other register.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            *self = Self::default();
            self.fpscr = FpscrReg(RESET_FPSCR);
        }
        self.vbr = RESET_VBR;
        self.pc = RESET_PC;
        self.sr_t = RESET_SR & 1;
        // Loaded directly: the bank registers are whatever they were.
        self.sr = SrStatus(RESET_SR & SR_MASK);
    }

    /// SR as the guest sees it, T included.
    pub fn sr_full(&self) -> u32 {
        (self.sr.0 & SR_MASK) | (self.sr_t & 1)
    }

    /// Writes SR, switching register banks when the effective bank changes.
    /// With MD clear the RB bit is forced to zero.
    pub fn set_sr_full(&mut self, value: u32) {
        let old_rb = self.sr.rb();
        let mut new = SrStatus(value & SR_MASK);

        if new.md() {
            if old_rb != new.rb() {
                self.switch_register_bank();
            }
        } else {
            if new.rb() {
                new.set_rb(false);
            }
            if old_rb {
                self.switch_register_bank();
            }
        }

        self.sr = new;
        self.sr_t = value & 1;
    }

    /// Swaps R0-R7 with the inactive bank.
    pub fn switch_register_bank(&mut self) {
        for i in 0..8 {
            std::mem::swap(&mut self.r[i], &mut self.r_bank[i]);
        }
    }

    /// Writes FPSCR, swapping FR and XF when the FR bit flips.
    pub fn set_fpscr(&mut self, value: u32) {
        let value = value & FPSCR_MASK;
        if (self.fpscr.0 ^ value) & (1 << 21) != 0 {
            std::mem::swap(&mut self.fr, &mut self.xf);
        }
        self.fpscr = FpscrReg(value);
    }

    pub fn fr(&self, n: usize) -> f32 {
        unsafe { self.fr.f32s[n] }
    }

    pub fn set_fr(&mut self, n: usize, value: f32) {
        unsafe { self.fr.f32s[n] = value }
    }

    pub fn fr_bits(&self, n: usize) -> u32 {
        unsafe { self.fr.u32s[n] }
    }

    pub fn set_fr_bits(&mut self, n: usize, value: u32) {
        unsafe { self.fr.u32s[n] = value }
    }

    pub fn xf_bits(&self, n: usize) -> u32 {
        unsafe { self.xf.u32s[n] }
    }

    pub fn set_xf_bits(&mut self, n: usize, value: u32) {
        unsafe { self.xf.u32s[n] = value }
    }

    /// `DRn`: high word in `fr[2n]`, low word in `fr[2n + 1]`.
    pub fn dr(&self, n: usize) -> f64 {
        let hi = self.fr_bits(n * 2) as u64;
        let lo = self.fr_bits(n * 2 + 1) as u64;
        f64::from_bits((hi << 32) | lo)
    }

    pub fn set_dr(&mut self, n: usize, value: f64) {
        let bits = value.to_bits();
        self.set_fr_bits(n * 2, (bits >> 32) as u32);
        self.set_fr_bits(n * 2 + 1, bits as u32);
    }

    pub fn mac(&self) -> u64 {
        unsafe { self.mac.full }
    }

    pub fn set_mac(&mut self, value: u64) {
        self.mac.full = value;
    }

    pub fn macl(&self) -> u32 {
        unsafe { self.mac.parts.l }
    }

    pub fn mach(&self) -> u32 {
        unsafe { self.mac.parts.h }
    }

    pub fn set_macl(&mut self, value: u32) {
        unsafe { self.mac.parts.l = value }
    }

    pub fn set_mach(&mut self, value: u32) {
        unsafe { self.mac.parts.h = value }
    }

    pub fn t(&self) -> bool {
        self.sr_t & 1 != 0
    }

    pub fn set_t(&mut self, value: bool) {
        self.sr_t = value as u32;
    }
}

impl std::fmt::Debug for Sh4Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sh4Context")
            .field("r", &format_args!("{:08x?}", self.r))
            .field("r_bank", &format_args!("{:08x?}", self.r_bank))
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("pr", &format_args!("{:#010x}", self.pr))
            .field("sr", &format_args!("{:#010x}", self.sr_full()))
            .field("fpscr", &format_args!("{:#010x}", self.fpscr.0))
            .field("gbr", &format_args!("{:#010x}", self.gbr))
            .field("vbr", &format_args!("{:#010x}", self.vbr))
            .field("mac", &format_args!("{:#018x}", self.mac()))
            .field("fpul", &format_args!("{:#010x}", self.fpul))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_layout() {
        assert_eq!(Sh4Context::R_OFFSETS[15], 60);
        assert_eq!(Sh4Context::R_BANK_OFFSET, 64);
        assert_eq!(Sh4Context::FR_OFFSET, 96);
        assert_eq!(Sh4Context::XF_OFFSET, 160);
        assert_eq!(Sh4Context::MAC_OFFSET, 224);
        assert_eq!(Sh4Context::SR_T_OFFSET, 232);
        assert_eq!(Sh4Context::PC_OFFSET, 276);
        assert_eq!(Sh4Context::PC_REL, -4);
        assert_eq!(Sh4Context::r_rel(0), -280);
    }

    #[test]
    fn dr_word_order() {
        let mut ctx = Sh4Context::new();
        ctx.set_dr(1, 1.0);
        assert_eq!(ctx.fr_bits(2), 0x3FF0_0000);
        assert_eq!(ctx.fr_bits(3), 0);
        assert_eq!(ctx.dr(1), 1.0);
    }

    #[test]
    fn sr_write_switches_banks() {
        let mut ctx = Sh4Context::new();
        ctx.set_sr_full(0x4000_0000);
        ctx.r[3] = 33;
        ctx.r_bank[3] = 44;
        ctx.set_sr_full(0x6000_0001);
        assert_eq!(ctx.r[3], 44);
        assert_eq!(ctx.r_bank[3], 33);
        assert!(ctx.t());
        assert_eq!(ctx.sr_full(), 0x6000_0001);

        // Leaving privileged mode always selects bank 0.
        ctx.set_sr_full(0x2000_0000);
        assert_eq!(ctx.r[3], 33);
        assert!(!ctx.sr.rb());
    }

    #[test]
    fn fpscr_fr_swaps_banks() {
        let mut ctx = Sh4Context::new();
        ctx.set_fr_bits(0, 1);
        ctx.set_xf_bits(0, 2);
        ctx.set_fpscr(1 << 21);
        assert_eq!(ctx.fr_bits(0), 2);
        assert_eq!(ctx.xf_bits(0), 1);
        ctx.set_fpscr(1 << 21 | 1 << 19);
        assert_eq!(ctx.fr_bits(0), 2);
    }

    #[test]
    fn soft_reset_keeps_registers() {
        let mut ctx = Sh4Context::new();
        ctx.r[5] = 0x1234;
        ctx.gbr = 0x8C00_0000;
        ctx.reset(false);
        assert_eq!(ctx.r[5], 0x1234);
        assert_eq!(ctx.gbr, 0x8C00_0000);
        assert_eq!(ctx.pc, RESET_PC);
        assert_eq!(ctx.sr_full(), RESET_SR);

        ctx.reset(true);
        assert_eq!(ctx.r[5], 0);
        assert_eq!(ctx.gbr, 0);
    }
}
