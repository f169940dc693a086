//! Intermediate representation produced by the decoder.
//!
//! One guest word decodes to one [`Instr`]. Operands are kept as written in
//! the opcode (register numbers, immediates, resolved PC-relative addresses);
//! FPU precision and transfer size are applied when the instruction runs.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    Byte,
    Word,
    Long,
}

impl Size {
    pub const fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Long => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    Sr,
    Gbr,
    Vbr,
    Ssr,
    Spc,
    Sgr,
    Dbr,
    Mach,
    Macl,
    Pr,
    Fpul,
    Fpscr,
    /// `Rn_BANK`, the inactive copy of R0-R7.
    Bank(u8),
}

impl SpecialReg {
    pub const fn is_privileged(self) -> bool {
        matches!(
            self,
            SpecialReg::Sr
                | SpecialReg::Vbr
                | SpecialReg::Ssr
                | SpecialReg::Spc
                | SpecialReg::Sgr
                | SpecialReg::Dbr
                | SpecialReg::Bank(_)
        )
    }

    pub const fn is_fpu(self) -> bool {
        matches!(self, SpecialReg::Fpul | SpecialReg::Fpscr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    #[default]
    None,
    Imm(u32),
    Reg(u8),
    FReg(u8),
    Special(SpecialReg),
}

impl Operand {
    /// Register number of a `Reg` or `FReg` operand.
    pub fn reg(self) -> usize {
        match self {
            Operand::Reg(n) | Operand::FReg(n) => n as usize,
            _ => 0,
        }
    }

    pub fn imm(self) -> u32 {
        match self {
            Operand::Imm(v) => v,
            _ => 0,
        }
    }

    pub fn special(self) -> Option<SpecialReg> {
        match self {
            Operand::Special(s) => Some(s),
            _ => None,
        }
    }
}

/// Operation of one instruction. `a` is the destination (or base register
/// for stores), `b` the source, `extra` a displacement, shift amount,
/// resolved address or branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Nop,
    Illegal,

    /// `a = b`, `b` a register or immediate.
    Mov,
    /// `R0 = extra`.
    Mova,

    /// `a = sext(@b)`
    Load(Size),
    /// `a = sext(@b); b += size` unless `a == b`.
    LoadPostInc(Size),
    /// `a = sext(@(R0 + b))`
    LoadIdxR0(Size),
    /// `a = sext(@(b + extra))`
    LoadDisp(Size),
    /// `R0 = sext(@(GBR + extra))`
    LoadGbrDisp(Size),
    /// `a = sext(@extra)`
    LoadPcRel(Size),
    /// `@a = b`
    Store(Size),
    /// `a -= size; @a = b` with `b` read before the decrement.
    StorePreDec(Size),
    /// `@(R0 + a) = b`
    StoreIdxR0(Size),
    /// `@(a + extra) = b`
    StoreDisp(Size),
    /// `@(GBR + extra) = R0`
    StoreGbrDisp(Size),

    /// `lds`/`ldc`: special register `a = b`.
    Ldc,
    /// `lds.l`/`ldc.l`: `a = @b; b += 4`.
    LdcPostInc,
    /// `sts`/`stc`: `a = ` special register `b`.
    Stc,
    /// `sts.l`/`stc.l`: `a -= 4; @a = b`.
    StcPreDec,

    Add,
    Addc,
    Addv,
    Sub,
    Subc,
    Subv,
    Neg,
    Negc,
    Dt,
    And,
    Or,
    Xor,
    Not,
    Tst,
    /// Byte logic on `@(R0 + GBR)` with `extra` as the immediate.
    AndB,
    OrB,
    XorB,
    TstB,
    ExtuB,
    ExtuW,
    ExtsB,
    ExtsW,
    SwapB,
    SwapW,
    Xtrct,
    CmpEq,
    CmpHs,
    CmpGe,
    CmpHi,
    CmpGt,
    CmpPz,
    CmpPl,
    CmpStr,
    Div0s,
    Div0u,
    Div1,
    DmulsL,
    DmuluL,
    MulL,
    MulsW,
    MuluW,
    MacL,
    MacW,
    Shll,
    Shlr,
    Shal,
    Shar,
    /// Logical shift by `extra` (2, 8 or 16).
    ShllN,
    ShlrN,
    Shad,
    Shld,
    Rotl,
    Rotr,
    Rotcl,
    Rotcr,
    Movt,
    Clrt,
    Sett,
    Clrs,
    Sets,
    Clrmac,
    Tas,

    Bt,
    Bf,
    BtS,
    BfS,
    Bra,
    Bsr,
    Braf,
    Bsrf,
    Jmp,
    Jsr,
    Rts,
    Rte,

    Trapa,
    Sleep,
    Ldtlb,
    Pref,
    Ocbi,
    Ocbp,
    Ocbwb,
    /// `@a = R0`
    Movca,

    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    FcmpEq,
    FcmpGt,
    Fmac,
    Fmov,
    /// `fmov @b, a`
    FLoad,
    FLoadPostInc,
    FLoadIdxR0,
    /// `fmov b, @a`
    FStore,
    FStorePreDec,
    FStoreIdxR0,
    Fldi0,
    Fldi1,
    Flds,
    Fsts,
    Float,
    Ftrc,
    Fneg,
    Fabs,
    Fsqrt,
    Fsrra,
    Fsca,
    Fipr,
    Ftrv,
    Fcnvds,
    Fcnvsd,
    Frchg,
    Fschg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Op,
    pub a: Operand,
    pub b: Operand,
    pub pc: u32,
    pub raw: u16,
    pub extra: u32,
}

impl Instr {
    pub const fn new(op: Op, pc: u32, raw: u16) -> Self {
        Instr {
            op,
            a: Operand::None,
            b: Operand::None,
            pc,
            raw,
            extra: 0,
        }
    }

    pub const fn with_a(mut self, a: Operand) -> Self {
        self.a = a;
        self
    }

    pub const fn with_b(mut self, b: Operand) -> Self {
        self.b = b;
        self
    }

    pub const fn with_extra(mut self, extra: u32) -> Self {
        self.extra = extra;
        self
    }

    /// Branches with a delay slot.
    pub const fn is_delayed(&self) -> bool {
        matches!(
            self.op,
            Op::BtS
                | Op::BfS
                | Op::Bra
                | Op::Bsr
                | Op::Braf
                | Op::Bsrf
                | Op::Jmp
                | Op::Jsr
                | Op::Rts
                | Op::Rte
        )
    }

    pub const fn is_branch(&self) -> bool {
        self.is_delayed() || matches!(self.op, Op::Bt | Op::Bf)
    }

    /// Instructions that may not sit in a delay slot.
    pub const fn is_slot_illegal(&self) -> bool {
        self.is_branch()
            || matches!(self.op, Op::Trapa | Op::Illegal)
            || self.writes_sr()
    }

    pub const fn writes_sr(&self) -> bool {
        matches!(self.op, Op::Ldc | Op::LdcPostInc)
            && matches!(self.a, Operand::Special(SpecialReg::Sr))
    }

    pub const fn is_privileged(&self) -> bool {
        match self.op {
            Op::Rte | Op::Sleep | Op::Ldtlb | Op::Ocbi | Op::Ocbp | Op::Ocbwb => true,
            Op::Ldc | Op::LdcPostInc => match self.a {
                Operand::Special(s) => s.is_privileged(),
                _ => false,
            },
            Op::Stc | Op::StcPreDec => match self.b {
                Operand::Special(s) => s.is_privileged(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Instructions that trap while SR.FD is set.
    pub const fn is_fpu(&self) -> bool {
        match self.op {
            Op::Fadd
            | Op::Fsub
            | Op::Fmul
            | Op::Fdiv
            | Op::FcmpEq
            | Op::FcmpGt
            | Op::Fmac
            | Op::Fmov
            | Op::FLoad
            | Op::FLoadPostInc
            | Op::FLoadIdxR0
            | Op::FStore
            | Op::FStorePreDec
            | Op::FStoreIdxR0
            | Op::Fldi0
            | Op::Fldi1
            | Op::Flds
            | Op::Fsts
            | Op::Float
            | Op::Ftrc
            | Op::Fneg
            | Op::Fabs
            | Op::Fsqrt
            | Op::Fsrra
            | Op::Fsca
            | Op::Fipr
            | Op::Ftrv
            | Op::Fcnvds
            | Op::Fcnvsd
            | Op::Frchg
            | Op::Fschg => true,
            Op::Ldc | Op::LdcPostInc => match self.a {
                Operand::Special(s) => s.is_fpu(),
                _ => false,
            },
            Op::Stc | Op::StcPreDec => match self.b {
                Operand::Special(s) => s.is_fpu(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Ends the block it is decoded into (together with its slot, if any).
    pub const fn ends_block(&self) -> bool {
        self.is_branch()
            || matches!(self.op, Op::Trapa | Op::Sleep | Op::Illegal)
            || self.writes_sr()
            || matches!(self.op, Op::Frchg)
            || (matches!(self.op, Op::Ldc | Op::LdcPostInc)
                && matches!(self.a, Operand::Special(SpecialReg::Fpscr)))
    }
}

/// Decoded code starting at one guest PC. Immutable once built, shared by
/// reference count.
#[derive(Debug)]
pub struct Block {
    pub start_pc: u32,
    /// PC after the last instruction when no branch is taken.
    pub pc_next: u32,
    pub instrs: Box<[Instr]>,
    /// Normalized guest physical range the block was decoded from.
    pub phys: Range<u32>,
    /// Whether writes to the source pages trap. Unguarded blocks are checked
    /// against memory before each reuse.
    pub guarded: bool,
}

impl Block {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn covers(&self, phys_addr: u32) -> bool {
        self.phys.contains(&phys_addr)
    }
}

/// Folds a guest address to the physical address used to track code.
/// RAM mirrors collapse onto area 3.
pub fn normalize_code_addr(addr: u32, ram_mask: u32) -> u32 {
    let phys = addr & 0x1FFF_FFFF;
    if phys & 0x1C00_0000 == 0x0C00_0000 {
        0x0C00_0000 | (phys & ram_mask)
    } else {
        phys
    }
}
