#![allow(non_snake_case)]

use crate::ir::{Instr, Op, Operand, Size, SpecialReg};

#[derive(Copy, Clone)]
pub struct OpcodeEntry {
    pub decode: fn(u32, u16) -> Instr,
    pub name: &'static str,
    pub mask: u16,
    pub key: u16,
    pub diss: &'static str,
}

impl std::fmt::Debug for OpcodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcodeEntry")
            .field("name", &self.name)
            .field("mask", &format_args!("{:#06x}", self.mask))
            .field("key", &format_args!("{:#06x}", self.key))
            .field("diss", &self.diss)
            .finish()
    }
}

const fn parse_opcode(pattern: &str) -> (u16, u16) {
    let bytes = pattern.as_bytes();
    let mut i = 1; // skip leading 'i'
    let mut mask: u16 = 0;
    let mut key: u16 = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'0' || c == b'1' {
            mask = (mask << 1) | 1;
            key = (key << 1) | (c == b'1') as u16;
        } else if c != b'_' {
            // wildcard
            mask <<= 1;
            key <<= 1;
        }
        i += 1;
    }
    (mask, key)
}

macro_rules! sh4op {
    (
        $( (disas = $diss:literal)
           $name:ident ( $pc:ident , $opcode:ident ) $body:block
        )*
    ) => {
        mod decoders {
            use super::*;
            $(
                #[allow(non_snake_case, unused_variables)]
                pub(super) fn $name($pc: u32, $opcode: u16) -> Instr $body
            )*
        }

        /// Every defined encoding, in table order.
        pub const OPCODES: &[OpcodeEntry] = &[
            $(
                {
                    const MASK_KEY: (u16, u16) = parse_opcode(stringify!($name));
                    OpcodeEntry {
                        decode: decoders::$name,
                        name: stringify!($name),
                        mask: MASK_KEY.0,
                        key: MASK_KEY.1,
                        diss: $diss,
                    }
                }
            ),*
        ];
    };
}

#[inline(always)]
fn GetN(str_: u16) -> usize {
    ((str_ >> 8) & 0xF) as usize
}
#[inline(always)]
fn GetM(str_: u16) -> usize {
    ((str_ >> 4) & 0xF) as usize
}
#[inline(always)]
fn GetImm4(str_: u16) -> u32 {
    (str_ & 0xF) as u32
}
#[inline(always)]
fn GetImm8(str_: u16) -> u32 {
    (str_ & 0xFF) as u32
}
#[inline(always)]
fn GetSImm8(str_: u16) -> i32 {
    (str_ & 0xFF) as i8 as i32
}
#[inline(always)]
fn GetImm12(str_: u16) -> u32 {
    (str_ & 0xFFF) as u32
}
#[inline(always)]
fn GetSImm12(str_: u16) -> i32 {
    ((((GetImm12(str_) as u16) << 4) as i16) >> 4) as i32
}

#[inline(always)]
pub fn data_target_s8(pc: u32, disp8: i32) -> u32 {
    (pc.wrapping_add(4) & 0xFFFF_FFFC).wrapping_add((disp8 << 2) as u32)
}
#[inline(always)]
pub fn branch_target_s8(pc: u32, disp8: i32) -> u32 {
    (disp8 as i64 * 2 + 4 + pc as i64) as u32
}
#[inline(always)]
pub fn branch_target_s12(pc: u32, disp12: i32) -> u32 {
    (disp12 as i64 * 2 + 4 + pc as i64) as u32
}

fn reg(n: usize) -> Operand {
    Operand::Reg(n as u8)
}

fn freg(n: usize) -> Operand {
    Operand::FReg(n as u8)
}

fn op_none(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode)
}

fn op_n(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode).with_a(reg(GetN(opcode)))
}

fn op_nm(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode)
        .with_a(reg(GetN(opcode)))
        .with_b(reg(GetM(opcode)))
}

fn op_fn(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode).with_a(freg(GetN(opcode)))
}

fn op_fnm(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode)
        .with_a(freg(GetN(opcode)))
        .with_b(freg(GetM(opcode)))
}

fn op_r0_imm(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode)
        .with_a(reg(0))
        .with_b(Operand::Imm(GetImm8(opcode)))
}

fn op_shift(op: Op, pc: u32, opcode: u16, amount: u32) -> Instr {
    op_n(op, pc, opcode).with_extra(amount)
}

fn op_ldc(sr: SpecialReg, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::Ldc, pc, opcode)
        .with_a(Operand::Special(sr))
        .with_b(reg(GetN(opcode)))
}

fn op_ldcl(sr: SpecialReg, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::LdcPostInc, pc, opcode)
        .with_a(Operand::Special(sr))
        .with_b(reg(GetN(opcode)))
}

fn op_stc(sr: SpecialReg, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::Stc, pc, opcode)
        .with_a(reg(GetN(opcode)))
        .with_b(Operand::Special(sr))
}

fn op_stcl(sr: SpecialReg, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::StcPreDec, pc, opcode)
        .with_a(reg(GetN(opcode)))
        .with_b(Operand::Special(sr))
}

fn bank(opcode: u16) -> SpecialReg {
    SpecialReg::Bank(((opcode >> 4) & 0x7) as u8)
}

fn op_bcond(op: Op, pc: u32, opcode: u16) -> Instr {
    Instr::new(op, pc, opcode).with_extra(branch_target_s8(pc, GetSImm8(opcode)))
}

fn op_store_disp(size: Size, pc: u32, opcode: u16) -> Instr {
    // R0,@(disp,Rn): base in the m field.
    Instr::new(Op::StoreDisp(size), pc, opcode)
        .with_a(reg(GetM(opcode)))
        .with_b(reg(0))
        .with_extra(GetImm4(opcode) * size.bytes())
}

fn op_load_disp(size: Size, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::LoadDisp(size), pc, opcode)
        .with_a(reg(0))
        .with_b(reg(GetM(opcode)))
        .with_extra(GetImm4(opcode) * size.bytes())
}

fn op_gbr_store(size: Size, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::StoreGbrDisp(size), pc, opcode)
        .with_b(reg(0))
        .with_extra(GetImm8(opcode) * size.bytes())
}

fn op_gbr_load(size: Size, pc: u32, opcode: u16) -> Instr {
    Instr::new(Op::LoadGbrDisp(size), pc, opcode)
        .with_a(reg(0))
        .with_extra(GetImm8(opcode) * size.bytes())
}

sh4op! {
    // ---------------- 0000 ----------------
    (disas = "stc SR,<REG_N>")
    i0000_nnnn_0000_0010(pc, opcode) { op_stc(SpecialReg::Sr, pc, opcode) }

    (disas = "stc GBR,<REG_N>")
    i0000_nnnn_0001_0010(pc, opcode) { op_stc(SpecialReg::Gbr, pc, opcode) }

    (disas = "stc VBR,<REG_N>")
    i0000_nnnn_0010_0010(pc, opcode) { op_stc(SpecialReg::Vbr, pc, opcode) }

    (disas = "stc SSR,<REG_N>")
    i0000_nnnn_0011_0010(pc, opcode) { op_stc(SpecialReg::Ssr, pc, opcode) }

    (disas = "stc SPC,<REG_N>")
    i0000_nnnn_0100_0010(pc, opcode) { op_stc(SpecialReg::Spc, pc, opcode) }

    (disas = "stc <RM_BANK>,<REG_N>")
    i0000_nnnn_1mmm_0010(pc, opcode) { op_stc(bank(opcode), pc, opcode) }

    (disas = "stc SGR,<REG_N>")
    i0000_nnnn_0011_1010(pc, opcode) { op_stc(SpecialReg::Sgr, pc, opcode) }

    (disas = "stc DBR,<REG_N>")
    i0000_nnnn_1111_1010(pc, opcode) { op_stc(SpecialReg::Dbr, pc, opcode) }

    (disas = "bsrf <REG_N>")
    i0000_nnnn_0000_0011(pc, opcode) { op_n(Op::Bsrf, pc, opcode) }

    (disas = "braf <REG_N>")
    i0000_nnnn_0010_0011(pc, opcode) { op_n(Op::Braf, pc, opcode) }

    (disas = "pref @<REG_N>")
    i0000_nnnn_1000_0011(pc, opcode) { op_n(Op::Pref, pc, opcode) }

    (disas = "ocbi @<REG_N>")
    i0000_nnnn_1001_0011(pc, opcode) { op_n(Op::Ocbi, pc, opcode) }

    (disas = "ocbp @<REG_N>")
    i0000_nnnn_1010_0011(pc, opcode) { op_n(Op::Ocbp, pc, opcode) }

    (disas = "ocbwb @<REG_N>")
    i0000_nnnn_1011_0011(pc, opcode) { op_n(Op::Ocbwb, pc, opcode) }

    (disas = "movca.l R0,@<REG_N>")
    i0000_nnnn_1100_0011(pc, opcode) { op_n(Op::Movca, pc, opcode) }

    (disas = "mov.b <REG_M>,@(R0,<REG_N>)")
    i0000_nnnn_mmmm_0100(pc, opcode) { op_nm(Op::StoreIdxR0(Size::Byte), pc, opcode) }

    (disas = "mov.w <REG_M>,@(R0,<REG_N>)")
    i0000_nnnn_mmmm_0101(pc, opcode) { op_nm(Op::StoreIdxR0(Size::Word), pc, opcode) }

    (disas = "mov.l <REG_M>,@(R0,<REG_N>)")
    i0000_nnnn_mmmm_0110(pc, opcode) { op_nm(Op::StoreIdxR0(Size::Long), pc, opcode) }

    (disas = "mul.l <REG_M>,<REG_N>")
    i0000_nnnn_mmmm_0111(pc, opcode) { op_nm(Op::MulL, pc, opcode) }

    (disas = "clrt")
    i0000_0000_0000_1000(pc, opcode) { op_none(Op::Clrt, pc, opcode) }

    (disas = "sett")
    i0000_0000_0001_1000(pc, opcode) { op_none(Op::Sett, pc, opcode) }

    (disas = "clrmac")
    i0000_0000_0010_1000(pc, opcode) { op_none(Op::Clrmac, pc, opcode) }

    (disas = "ldtlb")
    i0000_0000_0011_1000(pc, opcode) { op_none(Op::Ldtlb, pc, opcode) }

    (disas = "clrs")
    i0000_0000_0100_1000(pc, opcode) { op_none(Op::Clrs, pc, opcode) }

    (disas = "sets")
    i0000_0000_0101_1000(pc, opcode) { op_none(Op::Sets, pc, opcode) }

    (disas = "nop")
    i0000_0000_0000_1001(pc, opcode) { op_none(Op::Nop, pc, opcode) }

    (disas = "div0u")
    i0000_0000_0001_1001(pc, opcode) { op_none(Op::Div0u, pc, opcode) }

    (disas = "movt <REG_N>")
    i0000_nnnn_0010_1001(pc, opcode) { op_n(Op::Movt, pc, opcode) }

    (disas = "sts MACH,<REG_N>")
    i0000_nnnn_0000_1010(pc, opcode) { op_stc(SpecialReg::Mach, pc, opcode) }

    (disas = "sts MACL,<REG_N>")
    i0000_nnnn_0001_1010(pc, opcode) { op_stc(SpecialReg::Macl, pc, opcode) }

    (disas = "sts PR,<REG_N>")
    i0000_nnnn_0010_1010(pc, opcode) { op_stc(SpecialReg::Pr, pc, opcode) }

    (disas = "sts FPUL,<REG_N>")
    i0000_nnnn_0101_1010(pc, opcode) { op_stc(SpecialReg::Fpul, pc, opcode) }

    (disas = "sts FPSCR,<REG_N>")
    i0000_nnnn_0110_1010(pc, opcode) { op_stc(SpecialReg::Fpscr, pc, opcode) }

    (disas = "rts")
    i0000_0000_0000_1011(pc, opcode) { op_none(Op::Rts, pc, opcode) }

    (disas = "sleep")
    i0000_0000_0001_1011(pc, opcode) { op_none(Op::Sleep, pc, opcode) }

    (disas = "rte")
    i0000_0000_0010_1011(pc, opcode) { op_none(Op::Rte, pc, opcode) }

    (disas = "mov.b @(R0,<REG_M>),<REG_N>")
    i0000_nnnn_mmmm_1100(pc, opcode) { op_nm(Op::LoadIdxR0(Size::Byte), pc, opcode) }

    (disas = "mov.w @(R0,<REG_M>),<REG_N>")
    i0000_nnnn_mmmm_1101(pc, opcode) { op_nm(Op::LoadIdxR0(Size::Word), pc, opcode) }

    (disas = "mov.l @(R0,<REG_M>),<REG_N>")
    i0000_nnnn_mmmm_1110(pc, opcode) { op_nm(Op::LoadIdxR0(Size::Long), pc, opcode) }

    (disas = "mac.l @<REG_M>+,@<REG_N>+")
    i0000_nnnn_mmmm_1111(pc, opcode) { op_nm(Op::MacL, pc, opcode) }

    // ---------------- 0001 ----------------
    (disas = "mov.l <REG_M>,@(<disp4dw>,<REG_N>)")
    i0001_nnnn_mmmm_iiii(pc, opcode) {
        op_nm(Op::StoreDisp(Size::Long), pc, opcode).with_extra(GetImm4(opcode) << 2)
    }

    // ---------------- 0010 ----------------
    (disas = "mov.b <REG_M>,@<REG_N>")
    i0010_nnnn_mmmm_0000(pc, opcode) { op_nm(Op::Store(Size::Byte), pc, opcode) }

    (disas = "mov.w <REG_M>,@<REG_N>")
    i0010_nnnn_mmmm_0001(pc, opcode) { op_nm(Op::Store(Size::Word), pc, opcode) }

    (disas = "mov.l <REG_M>,@<REG_N>")
    i0010_nnnn_mmmm_0010(pc, opcode) { op_nm(Op::Store(Size::Long), pc, opcode) }

    (disas = "mov.b <REG_M>,@-<REG_N>")
    i0010_nnnn_mmmm_0100(pc, opcode) { op_nm(Op::StorePreDec(Size::Byte), pc, opcode) }

    (disas = "mov.w <REG_M>,@-<REG_N>")
    i0010_nnnn_mmmm_0101(pc, opcode) { op_nm(Op::StorePreDec(Size::Word), pc, opcode) }

    (disas = "mov.l <REG_M>,@-<REG_N>")
    i0010_nnnn_mmmm_0110(pc, opcode) { op_nm(Op::StorePreDec(Size::Long), pc, opcode) }

    (disas = "div0s <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_0111(pc, opcode) { op_nm(Op::Div0s, pc, opcode) }

    (disas = "tst <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1000(pc, opcode) { op_nm(Op::Tst, pc, opcode) }

    (disas = "and <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1001(pc, opcode) { op_nm(Op::And, pc, opcode) }

    (disas = "xor <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1010(pc, opcode) { op_nm(Op::Xor, pc, opcode) }

    (disas = "or <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1011(pc, opcode) { op_nm(Op::Or, pc, opcode) }

    (disas = "cmp/str <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1100(pc, opcode) { op_nm(Op::CmpStr, pc, opcode) }

    (disas = "xtrct <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1101(pc, opcode) { op_nm(Op::Xtrct, pc, opcode) }

    (disas = "mulu.w <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1110(pc, opcode) { op_nm(Op::MuluW, pc, opcode) }

    (disas = "muls.w <REG_M>,<REG_N>")
    i0010_nnnn_mmmm_1111(pc, opcode) { op_nm(Op::MulsW, pc, opcode) }

    // ---------------- 0011 ----------------
    (disas = "cmp/eq <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0000(pc, opcode) { op_nm(Op::CmpEq, pc, opcode) }

    (disas = "cmp/hs <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0010(pc, opcode) { op_nm(Op::CmpHs, pc, opcode) }

    (disas = "cmp/ge <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0011(pc, opcode) { op_nm(Op::CmpGe, pc, opcode) }

    (disas = "div1 <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0100(pc, opcode) { op_nm(Op::Div1, pc, opcode) }

    (disas = "dmulu.l <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0101(pc, opcode) { op_nm(Op::DmuluL, pc, opcode) }

    (disas = "cmp/hi <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0110(pc, opcode) { op_nm(Op::CmpHi, pc, opcode) }

    (disas = "cmp/gt <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_0111(pc, opcode) { op_nm(Op::CmpGt, pc, opcode) }

    (disas = "sub <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1000(pc, opcode) { op_nm(Op::Sub, pc, opcode) }

    (disas = "subc <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1010(pc, opcode) { op_nm(Op::Subc, pc, opcode) }

    (disas = "subv <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1011(pc, opcode) { op_nm(Op::Subv, pc, opcode) }

    (disas = "add <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1100(pc, opcode) { op_nm(Op::Add, pc, opcode) }

    (disas = "dmuls.l <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1101(pc, opcode) { op_nm(Op::DmulsL, pc, opcode) }

    (disas = "addc <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1110(pc, opcode) { op_nm(Op::Addc, pc, opcode) }

    (disas = "addv <REG_M>,<REG_N>")
    i0011_nnnn_mmmm_1111(pc, opcode) { op_nm(Op::Addv, pc, opcode) }

    // ---------------- 0100 ----------------
    (disas = "shll <REG_N>")
    i0100_nnnn_0000_0000(pc, opcode) { op_n(Op::Shll, pc, opcode) }

    (disas = "shlr <REG_N>")
    i0100_nnnn_0000_0001(pc, opcode) { op_n(Op::Shlr, pc, opcode) }

    (disas = "sts.l MACH,@-<REG_N>")
    i0100_nnnn_0000_0010(pc, opcode) { op_stcl(SpecialReg::Mach, pc, opcode) }

    (disas = "stc.l SR,@-<REG_N>")
    i0100_nnnn_0000_0011(pc, opcode) { op_stcl(SpecialReg::Sr, pc, opcode) }

    (disas = "rotl <REG_N>")
    i0100_nnnn_0000_0100(pc, opcode) { op_n(Op::Rotl, pc, opcode) }

    (disas = "rotr <REG_N>")
    i0100_nnnn_0000_0101(pc, opcode) { op_n(Op::Rotr, pc, opcode) }

    (disas = "lds.l @<REG_N>+,MACH")
    i0100_nnnn_0000_0110(pc, opcode) { op_ldcl(SpecialReg::Mach, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,SR")
    i0100_nnnn_0000_0111(pc, opcode) { op_ldcl(SpecialReg::Sr, pc, opcode) }

    (disas = "shll2 <REG_N>")
    i0100_nnnn_0000_1000(pc, opcode) { op_shift(Op::ShllN, pc, opcode, 2) }

    (disas = "shlr2 <REG_N>")
    i0100_nnnn_0000_1001(pc, opcode) { op_shift(Op::ShlrN, pc, opcode, 2) }

    (disas = "lds <REG_N>,MACH")
    i0100_nnnn_0000_1010(pc, opcode) { op_ldc(SpecialReg::Mach, pc, opcode) }

    (disas = "jsr @<REG_N>")
    i0100_nnnn_0000_1011(pc, opcode) { op_n(Op::Jsr, pc, opcode) }

    (disas = "ldc <REG_N>,SR")
    i0100_nnnn_0000_1110(pc, opcode) { op_ldc(SpecialReg::Sr, pc, opcode) }

    (disas = "dt <REG_N>")
    i0100_nnnn_0001_0000(pc, opcode) { op_n(Op::Dt, pc, opcode) }

    (disas = "cmp/pz <REG_N>")
    i0100_nnnn_0001_0001(pc, opcode) { op_n(Op::CmpPz, pc, opcode) }

    (disas = "sts.l MACL,@-<REG_N>")
    i0100_nnnn_0001_0010(pc, opcode) { op_stcl(SpecialReg::Macl, pc, opcode) }

    (disas = "stc.l GBR,@-<REG_N>")
    i0100_nnnn_0001_0011(pc, opcode) { op_stcl(SpecialReg::Gbr, pc, opcode) }

    (disas = "cmp/pl <REG_N>")
    i0100_nnnn_0001_0101(pc, opcode) { op_n(Op::CmpPl, pc, opcode) }

    (disas = "lds.l @<REG_N>+,MACL")
    i0100_nnnn_0001_0110(pc, opcode) { op_ldcl(SpecialReg::Macl, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,GBR")
    i0100_nnnn_0001_0111(pc, opcode) { op_ldcl(SpecialReg::Gbr, pc, opcode) }

    (disas = "shll8 <REG_N>")
    i0100_nnnn_0001_1000(pc, opcode) { op_shift(Op::ShllN, pc, opcode, 8) }

    (disas = "shlr8 <REG_N>")
    i0100_nnnn_0001_1001(pc, opcode) { op_shift(Op::ShlrN, pc, opcode, 8) }

    (disas = "lds <REG_N>,MACL")
    i0100_nnnn_0001_1010(pc, opcode) { op_ldc(SpecialReg::Macl, pc, opcode) }

    (disas = "tas.b @<REG_N>")
    i0100_nnnn_0001_1011(pc, opcode) { op_n(Op::Tas, pc, opcode) }

    (disas = "ldc <REG_N>,GBR")
    i0100_nnnn_0001_1110(pc, opcode) { op_ldc(SpecialReg::Gbr, pc, opcode) }

    (disas = "shal <REG_N>")
    i0100_nnnn_0010_0000(pc, opcode) { op_n(Op::Shal, pc, opcode) }

    (disas = "shar <REG_N>")
    i0100_nnnn_0010_0001(pc, opcode) { op_n(Op::Shar, pc, opcode) }

    (disas = "sts.l PR,@-<REG_N>")
    i0100_nnnn_0010_0010(pc, opcode) { op_stcl(SpecialReg::Pr, pc, opcode) }

    (disas = "stc.l VBR,@-<REG_N>")
    i0100_nnnn_0010_0011(pc, opcode) { op_stcl(SpecialReg::Vbr, pc, opcode) }

    (disas = "rotcl <REG_N>")
    i0100_nnnn_0010_0100(pc, opcode) { op_n(Op::Rotcl, pc, opcode) }

    (disas = "rotcr <REG_N>")
    i0100_nnnn_0010_0101(pc, opcode) { op_n(Op::Rotcr, pc, opcode) }

    (disas = "lds.l @<REG_N>+,PR")
    i0100_nnnn_0010_0110(pc, opcode) { op_ldcl(SpecialReg::Pr, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,VBR")
    i0100_nnnn_0010_0111(pc, opcode) { op_ldcl(SpecialReg::Vbr, pc, opcode) }

    (disas = "shll16 <REG_N>")
    i0100_nnnn_0010_1000(pc, opcode) { op_shift(Op::ShllN, pc, opcode, 16) }

    (disas = "shlr16 <REG_N>")
    i0100_nnnn_0010_1001(pc, opcode) { op_shift(Op::ShlrN, pc, opcode, 16) }

    (disas = "lds <REG_N>,PR")
    i0100_nnnn_0010_1010(pc, opcode) { op_ldc(SpecialReg::Pr, pc, opcode) }

    (disas = "jmp @<REG_N>")
    i0100_nnnn_0010_1011(pc, opcode) { op_n(Op::Jmp, pc, opcode) }

    (disas = "ldc <REG_N>,VBR")
    i0100_nnnn_0010_1110(pc, opcode) { op_ldc(SpecialReg::Vbr, pc, opcode) }

    (disas = "stc.l SGR,@-<REG_N>")
    i0100_nnnn_0011_0010(pc, opcode) { op_stcl(SpecialReg::Sgr, pc, opcode) }

    (disas = "stc.l SSR,@-<REG_N>")
    i0100_nnnn_0011_0011(pc, opcode) { op_stcl(SpecialReg::Ssr, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,SSR")
    i0100_nnnn_0011_0111(pc, opcode) { op_ldcl(SpecialReg::Ssr, pc, opcode) }

    (disas = "ldc <REG_N>,SGR")
    i0100_nnnn_0011_1010(pc, opcode) { op_ldc(SpecialReg::Sgr, pc, opcode) }

    (disas = "ldc <REG_N>,SSR")
    i0100_nnnn_0011_1110(pc, opcode) { op_ldc(SpecialReg::Ssr, pc, opcode) }

    (disas = "stc.l SPC,@-<REG_N>")
    i0100_nnnn_0100_0011(pc, opcode) { op_stcl(SpecialReg::Spc, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,SPC")
    i0100_nnnn_0100_0111(pc, opcode) { op_ldcl(SpecialReg::Spc, pc, opcode) }

    (disas = "ldc <REG_N>,SPC")
    i0100_nnnn_0100_1110(pc, opcode) { op_ldc(SpecialReg::Spc, pc, opcode) }

    (disas = "sts.l FPUL,@-<REG_N>")
    i0100_nnnn_0101_0010(pc, opcode) { op_stcl(SpecialReg::Fpul, pc, opcode) }

    (disas = "lds.l @<REG_N>+,FPUL")
    i0100_nnnn_0101_0110(pc, opcode) { op_ldcl(SpecialReg::Fpul, pc, opcode) }

    (disas = "lds <REG_N>,FPUL")
    i0100_nnnn_0101_1010(pc, opcode) { op_ldc(SpecialReg::Fpul, pc, opcode) }

    (disas = "sts.l FPSCR,@-<REG_N>")
    i0100_nnnn_0110_0010(pc, opcode) { op_stcl(SpecialReg::Fpscr, pc, opcode) }

    (disas = "lds.l @<REG_N>+,FPSCR")
    i0100_nnnn_0110_0110(pc, opcode) { op_ldcl(SpecialReg::Fpscr, pc, opcode) }

    (disas = "lds <REG_N>,FPSCR")
    i0100_nnnn_0110_1010(pc, opcode) { op_ldc(SpecialReg::Fpscr, pc, opcode) }

    (disas = "stc.l DBR,@-<REG_N>")
    i0100_nnnn_1111_0010(pc, opcode) { op_stcl(SpecialReg::Dbr, pc, opcode) }

    (disas = "ldc.l @<REG_N>+,DBR")
    i0100_nnnn_1111_0110(pc, opcode) { op_ldcl(SpecialReg::Dbr, pc, opcode) }

    (disas = "ldc <REG_N>,DBR")
    i0100_nnnn_1111_1010(pc, opcode) { op_ldc(SpecialReg::Dbr, pc, opcode) }

    (disas = "stc.l <RM_BANK>,@-<REG_N>")
    i0100_nnnn_1mmm_0011(pc, opcode) { op_stcl(bank(opcode), pc, opcode) }

    (disas = "ldc.l @<REG_N>+,<RM_BANK>")
    i0100_nnnn_1mmm_0111(pc, opcode) { op_ldcl(bank(opcode), pc, opcode) }

    (disas = "ldc <REG_N>,<RM_BANK>")
    i0100_nnnn_1mmm_1110(pc, opcode) { op_ldc(bank(opcode), pc, opcode) }

    (disas = "shad <REG_M>,<REG_N>")
    i0100_nnnn_mmmm_1100(pc, opcode) { op_nm(Op::Shad, pc, opcode) }

    (disas = "shld <REG_M>,<REG_N>")
    i0100_nnnn_mmmm_1101(pc, opcode) { op_nm(Op::Shld, pc, opcode) }

    (disas = "mac.w @<REG_M>+,@<REG_N>+")
    i0100_nnnn_mmmm_1111(pc, opcode) { op_nm(Op::MacW, pc, opcode) }

    // ---------------- 0101 ----------------
    (disas = "mov.l @(<disp4dw>,<REG_M>),<REG_N>")
    i0101_nnnn_mmmm_iiii(pc, opcode) {
        op_nm(Op::LoadDisp(Size::Long), pc, opcode).with_extra(GetImm4(opcode) << 2)
    }

    // ---------------- 0110 ----------------
    (disas = "mov.b @<REG_M>,<REG_N>")
    i0110_nnnn_mmmm_0000(pc, opcode) { op_nm(Op::Load(Size::Byte), pc, opcode) }

    (disas = "mov.w @<REG_M>,<REG_N>")
    i0110_nnnn_mmmm_0001(pc, opcode) { op_nm(Op::Load(Size::Word), pc, opcode) }

    (disas = "mov.l @<REG_M>,<REG_N>")
    i0110_nnnn_mmmm_0010(pc, opcode) { op_nm(Op::Load(Size::Long), pc, opcode) }

    (disas = "mov <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_0011(pc, opcode) { op_nm(Op::Mov, pc, opcode) }

    (disas = "mov.b @<REG_M>+,<REG_N>")
    i0110_nnnn_mmmm_0100(pc, opcode) { op_nm(Op::LoadPostInc(Size::Byte), pc, opcode) }

    (disas = "mov.w @<REG_M>+,<REG_N>")
    i0110_nnnn_mmmm_0101(pc, opcode) { op_nm(Op::LoadPostInc(Size::Word), pc, opcode) }

    (disas = "mov.l @<REG_M>+,<REG_N>")
    i0110_nnnn_mmmm_0110(pc, opcode) { op_nm(Op::LoadPostInc(Size::Long), pc, opcode) }

    (disas = "not <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_0111(pc, opcode) { op_nm(Op::Not, pc, opcode) }

    (disas = "swap.b <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1000(pc, opcode) { op_nm(Op::SwapB, pc, opcode) }

    (disas = "swap.w <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1001(pc, opcode) { op_nm(Op::SwapW, pc, opcode) }

    (disas = "negc <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1010(pc, opcode) { op_nm(Op::Negc, pc, opcode) }

    (disas = "neg <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1011(pc, opcode) { op_nm(Op::Neg, pc, opcode) }

    (disas = "extu.b <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1100(pc, opcode) { op_nm(Op::ExtuB, pc, opcode) }

    (disas = "extu.w <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1101(pc, opcode) { op_nm(Op::ExtuW, pc, opcode) }

    (disas = "exts.b <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1110(pc, opcode) { op_nm(Op::ExtsB, pc, opcode) }

    (disas = "exts.w <REG_M>,<REG_N>")
    i0110_nnnn_mmmm_1111(pc, opcode) { op_nm(Op::ExtsW, pc, opcode) }

    // ---------------- 0111 ----------------
    (disas = "add #<simm8>,<REG_N>")
    i0111_nnnn_iiii_iiii(pc, opcode) {
        op_n(Op::Add, pc, opcode).with_b(Operand::Imm(GetSImm8(opcode) as u32))
    }

    // ---------------- 1000 ----------------
    (disas = "mov.b R0,@(<disp4b>,<REG_M>)")
    i1000_0000_mmmm_iiii(pc, opcode) { op_store_disp(Size::Byte, pc, opcode) }

    (disas = "mov.w R0,@(<disp4w>,<REG_M>)")
    i1000_0001_mmmm_iiii(pc, opcode) { op_store_disp(Size::Word, pc, opcode) }

    (disas = "mov.b @(<disp4b>,<REG_M>),R0")
    i1000_0100_mmmm_iiii(pc, opcode) { op_load_disp(Size::Byte, pc, opcode) }

    (disas = "mov.w @(<disp4w>,<REG_M>),R0")
    i1000_0101_mmmm_iiii(pc, opcode) { op_load_disp(Size::Word, pc, opcode) }

    (disas = "cmp/eq #<simm8hex>,R0")
    i1000_1000_iiii_iiii(pc, opcode) {
        Instr::new(Op::CmpEq, pc, opcode)
            .with_a(reg(0))
            .with_b(Operand::Imm(GetSImm8(opcode) as u32))
    }

    (disas = "bt <bdisp8>")
    i1000_1001_iiii_iiii(pc, opcode) { op_bcond(Op::Bt, pc, opcode) }

    (disas = "bf <bdisp8>")
    i1000_1011_iiii_iiii(pc, opcode) { op_bcond(Op::Bf, pc, opcode) }

    (disas = "bt/s <bdisp8>")
    i1000_1101_iiii_iiii(pc, opcode) { op_bcond(Op::BtS, pc, opcode) }

    (disas = "bf/s <bdisp8>")
    i1000_1111_iiii_iiii(pc, opcode) { op_bcond(Op::BfS, pc, opcode) }

    // ---------------- 1001 ----------------
    (disas = "mov.w @(<PCdisp8w>),<REG_N>")
    i1001_nnnn_iiii_iiii(pc, opcode) {
        let addr = pc.wrapping_add(4).wrapping_add(GetImm8(opcode) << 1);
        op_n(Op::LoadPcRel(Size::Word), pc, opcode).with_extra(addr)
    }

    // ---------------- 1010 / 1011 ----------------
    (disas = "bra <bdisp12>")
    i1010_iiii_iiii_iiii(pc, opcode) {
        Instr::new(Op::Bra, pc, opcode).with_extra(branch_target_s12(pc, GetSImm12(opcode)))
    }

    (disas = "bsr <bdisp12>")
    i1011_iiii_iiii_iiii(pc, opcode) {
        Instr::new(Op::Bsr, pc, opcode).with_extra(branch_target_s12(pc, GetSImm12(opcode)))
    }

    // ---------------- 1100 ----------------
    (disas = "mov.b R0,@(<GBRdisp8b>)")
    i1100_0000_iiii_iiii(pc, opcode) { op_gbr_store(Size::Byte, pc, opcode) }

    (disas = "mov.w R0,@(<GBRdisp8w>)")
    i1100_0001_iiii_iiii(pc, opcode) { op_gbr_store(Size::Word, pc, opcode) }

    (disas = "mov.l R0,@(<GBRdisp8dw>)")
    i1100_0010_iiii_iiii(pc, opcode) { op_gbr_store(Size::Long, pc, opcode) }

    (disas = "trapa #<imm8>")
    i1100_0011_iiii_iiii(pc, opcode) {
        Instr::new(Op::Trapa, pc, opcode).with_extra(GetImm8(opcode))
    }

    (disas = "mov.b @(<GBRdisp8b>),R0")
    i1100_0100_iiii_iiii(pc, opcode) { op_gbr_load(Size::Byte, pc, opcode) }

    (disas = "mov.w @(<GBRdisp8w>),R0")
    i1100_0101_iiii_iiii(pc, opcode) { op_gbr_load(Size::Word, pc, opcode) }

    (disas = "mov.l @(<GBRdisp8dw>),R0")
    i1100_0110_iiii_iiii(pc, opcode) { op_gbr_load(Size::Long, pc, opcode) }

    (disas = "mova @(<PCdisp8d>),R0")
    i1100_0111_iiii_iiii(pc, opcode) {
        Instr::new(Op::Mova, pc, opcode)
            .with_a(reg(0))
            .with_extra(data_target_s8(pc, GetImm8(opcode) as i32))
    }

    (disas = "tst #<imm8>,R0")
    i1100_1000_iiii_iiii(pc, opcode) { op_r0_imm(Op::Tst, pc, opcode) }

    (disas = "and #<imm8>,R0")
    i1100_1001_iiii_iiii(pc, opcode) { op_r0_imm(Op::And, pc, opcode) }

    (disas = "xor #<imm8>,R0")
    i1100_1010_iiii_iiii(pc, opcode) { op_r0_imm(Op::Xor, pc, opcode) }

    (disas = "or #<imm8>,R0")
    i1100_1011_iiii_iiii(pc, opcode) { op_r0_imm(Op::Or, pc, opcode) }

    (disas = "tst.b #<imm8>,@(R0,GBR)")
    i1100_1100_iiii_iiii(pc, opcode) {
        Instr::new(Op::TstB, pc, opcode).with_extra(GetImm8(opcode))
    }

    (disas = "and.b #<imm8>,@(R0,GBR)")
    i1100_1101_iiii_iiii(pc, opcode) {
        Instr::new(Op::AndB, pc, opcode).with_extra(GetImm8(opcode))
    }

    (disas = "xor.b #<imm8>,@(R0,GBR)")
    i1100_1110_iiii_iiii(pc, opcode) {
        Instr::new(Op::XorB, pc, opcode).with_extra(GetImm8(opcode))
    }

    (disas = "or.b #<imm8>,@(R0,GBR)")
    i1100_1111_iiii_iiii(pc, opcode) {
        Instr::new(Op::OrB, pc, opcode).with_extra(GetImm8(opcode))
    }

    // ---------------- 1101 / 1110 ----------------
    (disas = "mov.l @(<PCdisp8d>),<REG_N>")
    i1101_nnnn_iiii_iiii(pc, opcode) {
        let addr = data_target_s8(pc, GetImm8(opcode) as i32);
        op_n(Op::LoadPcRel(Size::Long), pc, opcode).with_extra(addr)
    }

    (disas = "mov #<simm8hex>,<REG_N>")
    i1110_nnnn_iiii_iiii(pc, opcode) {
        op_n(Op::Mov, pc, opcode).with_b(Operand::Imm(GetSImm8(opcode) as u32))
    }

    // ---------------- 1111 ----------------
    (disas = "fadd <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0000(pc, opcode) { op_fnm(Op::Fadd, pc, opcode) }

    (disas = "fsub <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0001(pc, opcode) { op_fnm(Op::Fsub, pc, opcode) }

    (disas = "fmul <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0010(pc, opcode) { op_fnm(Op::Fmul, pc, opcode) }

    (disas = "fdiv <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0011(pc, opcode) { op_fnm(Op::Fdiv, pc, opcode) }

    (disas = "fcmp/eq <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0100(pc, opcode) { op_fnm(Op::FcmpEq, pc, opcode) }

    (disas = "fcmp/gt <FREG_M_SD_F>,<FREG_N_SD_F>")
    i1111_nnnn_mmmm_0101(pc, opcode) { op_fnm(Op::FcmpGt, pc, opcode) }

    (disas = "fmov.s @(R0,<REG_M>),<FREG_N_SD_A>")
    i1111_nnnn_mmmm_0110(pc, opcode) {
        Instr::new(Op::FLoadIdxR0, pc, opcode)
            .with_a(freg(GetN(opcode)))
            .with_b(reg(GetM(opcode)))
    }

    (disas = "fmov.s <FREG_M_SD_A>,@(R0,<REG_N>)")
    i1111_nnnn_mmmm_0111(pc, opcode) {
        Instr::new(Op::FStoreIdxR0, pc, opcode)
            .with_a(reg(GetN(opcode)))
            .with_b(freg(GetM(opcode)))
    }

    (disas = "fmov.s @<REG_M>,<FREG_N_SD_A>")
    i1111_nnnn_mmmm_1000(pc, opcode) {
        Instr::new(Op::FLoad, pc, opcode)
            .with_a(freg(GetN(opcode)))
            .with_b(reg(GetM(opcode)))
    }

    (disas = "fmov.s @<REG_M>+,<FREG_N_SD_A>")
    i1111_nnnn_mmmm_1001(pc, opcode) {
        Instr::new(Op::FLoadPostInc, pc, opcode)
            .with_a(freg(GetN(opcode)))
            .with_b(reg(GetM(opcode)))
    }

    (disas = "fmov.s <FREG_M_SD_A>,@<REG_N>")
    i1111_nnnn_mmmm_1010(pc, opcode) {
        Instr::new(Op::FStore, pc, opcode)
            .with_a(reg(GetN(opcode)))
            .with_b(freg(GetM(opcode)))
    }

    (disas = "fmov.s <FREG_M_SD_A>,@-<REG_N>")
    i1111_nnnn_mmmm_1011(pc, opcode) {
        Instr::new(Op::FStorePreDec, pc, opcode)
            .with_a(reg(GetN(opcode)))
            .with_b(freg(GetM(opcode)))
    }

    (disas = "fmov <FREG_M_SD_A>,<FREG_N_SD_A>")
    i1111_nnnn_mmmm_1100(pc, opcode) { op_fnm(Op::Fmov, pc, opcode) }

    (disas = "fmac <FREG_0>,<FREG_M>,<FREG_N>")
    i1111_nnnn_mmmm_1110(pc, opcode) { op_fnm(Op::Fmac, pc, opcode) }

    (disas = "fsts FPUL,<FREG_N>")
    i1111_nnnn_0000_1101(pc, opcode) { op_fn(Op::Fsts, pc, opcode) }

    (disas = "flds <FREG_N>,FPUL")
    i1111_nnnn_0001_1101(pc, opcode) {
        Instr::new(Op::Flds, pc, opcode).with_b(freg(GetN(opcode)))
    }

    (disas = "float FPUL,<FREG_N_SD_F>")
    i1111_nnnn_0010_1101(pc, opcode) { op_fn(Op::Float, pc, opcode) }

    (disas = "ftrc <FREG_N_SD_F>,FPUL")
    i1111_nnnn_0011_1101(pc, opcode) {
        Instr::new(Op::Ftrc, pc, opcode).with_b(freg(GetN(opcode)))
    }

    (disas = "fneg <FREG_N_SD_F>")
    i1111_nnnn_0100_1101(pc, opcode) { op_fn(Op::Fneg, pc, opcode) }

    (disas = "fabs <FREG_N_SD_F>")
    i1111_nnnn_0101_1101(pc, opcode) { op_fn(Op::Fabs, pc, opcode) }

    (disas = "fsqrt <FREG_N_SD_F>")
    i1111_nnnn_0110_1101(pc, opcode) { op_fn(Op::Fsqrt, pc, opcode) }

    (disas = "fsrra <FREG_N>")
    i1111_nnnn_0111_1101(pc, opcode) { op_fn(Op::Fsrra, pc, opcode) }

    (disas = "fldi0 <FREG_N>")
    i1111_nnnn_1000_1101(pc, opcode) { op_fn(Op::Fldi0, pc, opcode) }

    (disas = "fldi1 <FREG_N>")
    i1111_nnnn_1001_1101(pc, opcode) { op_fn(Op::Fldi1, pc, opcode) }

    (disas = "fcnvsd FPUL,<DR_N>")
    i1111_nnn0_1010_1101(pc, opcode) { op_fn(Op::Fcnvsd, pc, opcode) }

    (disas = "fcnvds <DR_N>,FPUL")
    i1111_nnn0_1011_1101(pc, opcode) {
        Instr::new(Op::Fcnvds, pc, opcode).with_b(freg(GetN(opcode)))
    }

    (disas = "fipr <FV_M>,<FV_N>")
    i1111_nnmm_1110_1101(pc, opcode) {
        let n = ((opcode >> 10) & 0x3) as usize;
        let m = ((opcode >> 8) & 0x3) as usize;
        Instr::new(Op::Fipr, pc, opcode).with_a(freg(n * 4)).with_b(freg(m * 4))
    }

    (disas = "fsca FPUL,<DR_N>")
    i1111_nnn0_1111_1101(pc, opcode) { op_fn(Op::Fsca, pc, opcode) }

    (disas = "ftrv XMTRX,<FV_N>")
    i1111_nn01_1111_1101(pc, opcode) {
        let n = ((opcode >> 10) & 0x3) as usize;
        Instr::new(Op::Ftrv, pc, opcode).with_a(freg(n * 4))
    }

    (disas = "fschg")
    i1111_0011_1111_1101(pc, opcode) { op_none(Op::Fschg, pc, opcode) }

    (disas = "frchg")
    i1111_1011_1111_1101(pc, opcode) { op_none(Op::Frchg, pc, opcode) }
}

const NO_ENTRY: u16 = u16::MAX;

/// Expands every pattern over its wildcard bits. Later entries win on
/// overlap, words left over stay `NO_ENTRY`.
pub const fn build_decode_index(opcodes: &[OpcodeEntry]) -> [u16; 0x10000] {
    let mut table = [NO_ENTRY; 0x10000];

    let mut i = 0;
    while i < opcodes.len() {
        let free = !opcodes[i].mask;
        let key = opcodes[i].key & opcodes[i].mask;

        // Walks every subset of the wildcard bits.
        let mut sub: u16 = 0;
        loop {
            table[(key | sub) as usize] = i as u16;
            if sub == free {
                break;
            }
            sub = sub.wrapping_sub(free) & free;
        }
        i += 1;
    }

    table
}

static DECODE_INDEX: [u16; 0x10000] = build_decode_index(OPCODES);

/// Table entry for `opcode`, `None` for undefined encodings.
pub fn opcode_entry(opcode: u16) -> Option<&'static OpcodeEntry> {
    OPCODES.get(DECODE_INDEX[opcode as usize] as usize)
}

/// Decodes one word. Total: undefined encodings become `Op::Illegal`.
pub fn decode(pc: u32, opcode: u16) -> Instr {
    match opcode_entry(opcode) {
        Some(entry) => (entry.decode)(pc, opcode),
        None => Instr::new(Op::Illegal, pc, opcode),
    }
}

pub fn format_disas(pc: u32, opcode: u16) -> String {
    let Some(entry) = opcode_entry(opcode) else {
        return format!(".word {opcode:#06x}");
    };
    let mut out = entry.diss.to_string();

    // ---------------- General-purpose registers ----------------
    if out.contains("<REG_N>") {
        out = out.replace("<REG_N>", &format!("r{}", GetN(opcode)));
    }
    if out.contains("<REG_M>") {
        out = out.replace("<REG_M>", &format!("r{}", GetM(opcode)));
    }
    if out.contains("<RM_BANK>") {
        out = out.replace("<RM_BANK>", &format!("r{}_bank", (opcode >> 4) & 0x7));
    }

    // ---------------- Immediates ----------------
    if out.contains("<imm8>") {
        out = out.replace("<imm8>", &format!("{:#x}", GetImm8(opcode)));
    }
    if out.contains("<simm8>") {
        out = out.replace("<simm8>", &format!("{}", GetSImm8(opcode)));
    }
    if out.contains("<simm8hex>") {
        out = out.replace("<simm8hex>", &format!("{:#x}", GetSImm8(opcode)));
    }

    // ---------------- Branch targets ----------------
    if out.contains("<bdisp8>") {
        let target = branch_target_s8(pc, GetSImm8(opcode));
        out = out.replace("<bdisp8>", &format!("{target:#010x}"));
    }
    if out.contains("<bdisp12>") {
        let target = branch_target_s12(pc, GetSImm12(opcode));
        out = out.replace("<bdisp12>", &format!("{target:#010x}"));
    }

    // 4-bit disps
    if out.contains("<disp4b>") {
        out = out.replace("<disp4b>", &format!("{:#x}", GetImm4(opcode)));
    }
    if out.contains("<disp4w>") {
        out = out.replace("<disp4w>", &format!("{:#x}", GetImm4(opcode) << 1));
    }
    if out.contains("<disp4dw>") {
        out = out.replace("<disp4dw>", &format!("{:#x}", GetImm4(opcode) << 2));
    }

    // PC relative
    if out.contains("<PCdisp8d>") {
        let addr = data_target_s8(pc, GetImm8(opcode) as i32);
        out = out.replace("<PCdisp8d>", &format!("{addr:#010x}"));
    }
    if out.contains("<PCdisp8w>") {
        let addr = pc.wrapping_add(4).wrapping_add(GetImm8(opcode) << 1);
        out = out.replace("<PCdisp8w>", &format!("{addr:#010x}"));
    }

    // GBR disps
    if out.contains("<GBRdisp8b>") {
        out = out.replace("<GBRdisp8b>", &format!("{:#x},GBR", GetImm8(opcode)));
    }
    if out.contains("<GBRdisp8w>") {
        out = out.replace("<GBRdisp8w>", &format!("{:#x},GBR", GetImm8(opcode) << 1));
    }
    if out.contains("<GBRdisp8dw>") {
        out = out.replace("<GBRdisp8dw>", &format!("{:#x},GBR", GetImm8(opcode) << 2));
    }

    // ---------------- Floating-point regs ----------------
    for tag in ["<FREG_N>", "<FREG_N_SD_F>", "<FREG_N_SD_A>"] {
        if out.contains(tag) {
            out = out.replace(tag, &format!("fr{}", GetN(opcode)));
        }
    }
    for tag in ["<FREG_M>", "<FREG_M_SD_F>", "<FREG_M_SD_A>"] {
        if out.contains(tag) {
            out = out.replace(tag, &format!("fr{}", GetM(opcode)));
        }
    }
    if out.contains("<FREG_0>") {
        out = out.replace("<FREG_0>", "fr0");
    }
    if out.contains("<DR_N>") {
        out = out.replace("<DR_N>", &format!("dr{}", GetN(opcode) & 0xE));
    }
    if out.contains("<FV_N>") {
        out = out.replace("<FV_N>", &format!("fv{}", ((opcode >> 10) & 0x3) * 4));
    }
    if out.contains("<FV_M>") {
        out = out.replace("<FV_M>", &format!("fv{}", ((opcode >> 8) & 0x3) * 4));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_do_not_overlap() {
        let mut owner = vec![None; 0x10000];
        for (i, entry) in OPCODES.iter().enumerate() {
            for word in 0..=0xFFFFu32 {
                if word as u16 & entry.mask == entry.key {
                    if let Some(prev) = owner[word as usize] {
                        let prev: &OpcodeEntry = &OPCODES[prev];
                        panic!("{:04x}: {} overlaps {}", word, entry.name, prev.name);
                    }
                    owner[word as usize] = Some(i);
                }
            }
        }
    }

    #[test]
    fn index_matches_patterns() {
        for word in 0..=0xFFFFu16 {
            if let Some(entry) = opcode_entry(word) {
                assert_eq!(word & entry.mask, entry.key, "{word:04x} -> {}", entry.name);
            }
        }
    }

    #[test]
    fn pc_relative_forms_carry_the_absolute_address() {
        let i = decode(0x8C00_0002, 0xC701); // mova @(4,pc),r0
        assert_eq!((i.op, i.a, i.b), (Op::Mova, Operand::Reg(0), Operand::None));
        assert_eq!(i.extra, 0x8C00_0008);

        let i = decode(0x8C00_0002, 0x9301); // mov.w @(2,pc),r3
        assert_eq!((i.a, i.b), (Operand::Reg(3), Operand::None));
        assert_eq!(i.extra, 0x8C00_0008);
    }

    #[test]
    fn decodes_families() {
        let i = decode(0x8C00_0000, 0x6516); // mov.l @r1+,r5
        assert_eq!(i.op, Op::LoadPostInc(Size::Long));
        assert_eq!((i.a, i.b), (Operand::Reg(5), Operand::Reg(1)));

        let i = decode(0x8C00_0010, 0xD102); // mov.l @(8,pc),r1
        assert_eq!(i.op, Op::LoadPcRel(Size::Long));
        assert_eq!(i.extra, 0x8C00_001C);

        let i = decode(0x8C00_0000, 0xAFFE); // bra -4 bytes from pc+4
        assert_eq!(i.op, Op::Bra);
        assert_eq!(i.extra, 0x8C00_0000);

        let i = decode(0, 0x43CE); // ldc r3,r4_bank
        assert_eq!(i.a, Operand::Special(SpecialReg::Bank(4)));
        assert_eq!(i.b, Operand::Reg(3));

        let i = decode(0, 0xF6ED); // fipr fv8,fv4
        assert_eq!((i.op, i.a, i.b), (Op::Fipr, Operand::FReg(4), Operand::FReg(8)));

        assert_eq!(decode(0, 0xFFFF).op, Op::Illegal);
        assert_eq!(decode(0, 0x0000).op, Op::Illegal);
    }

    #[test]
    fn disassembles() {
        assert_eq!(format_disas(0x8C00_0000, 0x6516), "mov.l @r1+,r5");
        assert_eq!(format_disas(0x8C00_0000, 0x7FFF), "add #-1,r15");
        assert_eq!(format_disas(0x8C00_0000, 0x8B02), "bf 0x8c000008");
        assert_eq!(format_disas(0x8C00_0002, 0xC702), "mova @(0x8c00000c),R0");
        assert_eq!(format_disas(0, 0x0083), "pref @r0");
        assert_eq!(format_disas(0, 0xFFFF), ".word 0xffff");
    }
}
