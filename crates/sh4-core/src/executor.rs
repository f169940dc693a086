//! Runs decoded instructions against a context and a bus.
//!
//! A unit is one instruction, or a delayed branch together with its slot.
//! Units either complete and leave `ctx.pc` at the next instruction, or
//! raise an exception before changing any register the faulting access
//! would have written.

use crate::backend_ipr::*;
use crate::context::Sh4Context;
use crate::exceptions::Sh4Exception;
use crate::ir::{Block, Instr, Op, Operand, Size, SpecialReg};
use crate::sh4dec::decode;
use crate::sh4mem::{MemoryBus, MemoryData, read_mem, write_mem};

/// How a unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `ctx.pc` is the next sequential instruction.
    Next,
    /// A branch was evaluated, taken or not.
    Jump,
    /// `sleep`; `ctx.pc` is past it.
    Sleep,
}

/// An exception and the address the guest resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised {
    pub exception: Sh4Exception,
    pub pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    Completed,
    Sleep,
    /// Stopped at a boundary on request; `ctx.pc` is the next unit.
    Stopped,
    Raised(Raised),
}

enum Flow {
    Next,
    Jump(u32),
    Delayed { taken: bool, target: u32 },
    Sleep,
}

type Exec<T> = Result<T, Sh4Exception>;

#[inline(always)]
fn read<T: MemoryData, B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> Exec<T> {
    if addr as usize & (size_of::<T>() - 1) != 0 {
        return Err(Sh4Exception::AddressErrorRead(addr));
    }
    Ok(read_mem(bus, addr))
}

#[inline(always)]
fn write<T: MemoryData, B: MemoryBus + ?Sized>(bus: &mut B, addr: u32, value: T) -> Exec<()> {
    if addr as usize & (size_of::<T>() - 1) != 0 {
        return Err(Sh4Exception::AddressErrorWrite(addr));
    }
    write_mem(bus, addr, value);
    Ok(())
}

/// Sign-extending load.
fn load<B: MemoryBus + ?Sized>(bus: &mut B, size: Size, addr: u32) -> Exec<u32> {
    Ok(match size {
        Size::Byte => read::<u8, B>(bus, addr)? as i8 as u32,
        Size::Word => read::<u16, B>(bus, addr)? as i16 as u32,
        Size::Long => read::<u32, B>(bus, addr)?,
    })
}

fn store<B: MemoryBus + ?Sized>(bus: &mut B, size: Size, addr: u32, value: u32) -> Exec<()> {
    match size {
        Size::Byte => write(bus, addr, value as u8),
        Size::Word => write(bus, addr, value as u16),
        Size::Long => write(bus, addr, value),
    }
}

fn read_special(ctx: &Sh4Context, sr: SpecialReg) -> u32 {
    match sr {
        SpecialReg::Sr => ctx.sr_full(),
        SpecialReg::Gbr => ctx.gbr,
        SpecialReg::Vbr => ctx.vbr,
        SpecialReg::Ssr => ctx.ssr,
        SpecialReg::Spc => ctx.spc,
        SpecialReg::Sgr => ctx.sgr,
        SpecialReg::Dbr => ctx.dbr,
        SpecialReg::Mach => ctx.mach(),
        SpecialReg::Macl => ctx.macl(),
        SpecialReg::Pr => ctx.pr,
        SpecialReg::Fpul => ctx.fpul,
        SpecialReg::Fpscr => ctx.fpscr.full(),
        SpecialReg::Bank(n) => ctx.r_bank[n as usize & 7],
    }
}

fn write_special(ctx: &mut Sh4Context, sr: SpecialReg, value: u32) {
    match sr {
        SpecialReg::Sr => ctx.set_sr_full(value),
        SpecialReg::Gbr => ctx.gbr = value,
        SpecialReg::Vbr => ctx.vbr = value,
        SpecialReg::Ssr => ctx.ssr = value,
        SpecialReg::Spc => ctx.spc = value,
        SpecialReg::Sgr => ctx.sgr = value,
        SpecialReg::Dbr => ctx.dbr = value,
        SpecialReg::Mach => ctx.set_mach(value),
        SpecialReg::Macl => ctx.set_macl(value),
        SpecialReg::Pr => ctx.pr = value,
        SpecialReg::Fpul => ctx.fpul = value,
        SpecialReg::Fpscr => ctx.set_fpscr(value),
        SpecialReg::Bank(n) => ctx.r_bank[n as usize & 7] = value,
    }
}

/// 64-bit transfer register: even numbers are `DRn`, odd ones `XDn`.
fn pair_bits(ctx: &Sh4Context, n: usize) -> u64 {
    unsafe {
        if n & 1 == 0 {
            ctx.fr.u64s[n >> 1]
        } else {
            ctx.xf.u64s[n >> 1]
        }
    }
}

fn set_pair_bits(ctx: &mut Sh4Context, n: usize, value: u64) {
    unsafe {
        if n & 1 == 0 {
            ctx.fr.u64s[n >> 1] = value;
        } else {
            ctx.xf.u64s[n >> 1] = value;
        }
    }
}

fn fv(ctx: &Sh4Context, n: usize) -> [f32; 4] {
    [ctx.fr(n), ctx.fr(n + 1), ctx.fr(n + 2), ctx.fr(n + 3)]
}

/// Checks that do not depend on operands: privilege, FPU enable, slot rules.
fn check_allowed(ctx: &Sh4Context, i: &Instr, in_slot: bool) -> Exec<()> {
    if in_slot && i.is_slot_illegal() {
        return Err(Sh4Exception::SlotIllegalInstruction);
    }
    if i.op == Op::Illegal || (i.is_privileged() && !ctx.sr.md()) {
        return Err(if in_slot {
            Sh4Exception::SlotIllegalInstruction
        } else {
            Sh4Exception::IllegalInstruction
        });
    }
    if i.is_fpu() && ctx.sr.fd() {
        return Err(if in_slot {
            Sh4Exception::SlotFpuDisabled
        } else {
            Sh4Exception::FpuDisabled
        });
    }
    Ok(())
}

/// Executes one instruction. Delayed branches only evaluate their target
/// here; the caller runs the slot.
fn exec_op<B: MemoryBus + ?Sized>(ctx: &mut Sh4Context, bus: &mut B, i: &Instr) -> Exec<Flow> {
    let n = i.a.reg();
    let m = i.b.reg();
    let pr = ctx.fpscr.pr();
    let sz = ctx.fpscr.sz();

    // Source operand of two-operand ALU forms.
    let src = |ctx: &Sh4Context| match i.b {
        Operand::Imm(v) => v,
        _ => ctx.r[m],
    };

    match i.op {
        Op::Nop => {}
        Op::Illegal => return Err(Sh4Exception::IllegalInstruction),

        // ---------------- Moves and loads/stores ----------------
        Op::Mov => ctx.r[n] = src(ctx),
        Op::Mova => ctx.r[0] = i.extra,
        Op::Load(size) => ctx.r[n] = load(bus, size, ctx.r[m])?,
        Op::LoadPostInc(size) => {
            let value = load(bus, size, ctx.r[m])?;
            ctx.r[m] = ctx.r[m].wrapping_add(size.bytes());
            // With n == m the loaded value wins.
            ctx.r[n] = value;
        }
        Op::LoadIdxR0(size) => ctx.r[n] = load(bus, size, ctx.r[0].wrapping_add(ctx.r[m]))?,
        Op::LoadDisp(size) => ctx.r[n] = load(bus, size, ctx.r[m].wrapping_add(i.extra))?,
        Op::LoadGbrDisp(size) => ctx.r[0] = load(bus, size, ctx.gbr.wrapping_add(i.extra))?,
        Op::LoadPcRel(size) => ctx.r[n] = load(bus, size, i.extra)?,
        Op::Store(size) => store(bus, size, ctx.r[n], ctx.r[m])?,
        Op::StorePreDec(size) => {
            let value = ctx.r[m];
            let addr = ctx.r[n].wrapping_sub(size.bytes());
            store(bus, size, addr, value)?;
            ctx.r[n] = addr;
        }
        Op::StoreIdxR0(size) => store(bus, size, ctx.r[0].wrapping_add(ctx.r[n]), ctx.r[m])?,
        Op::StoreDisp(size) => store(bus, size, ctx.r[n].wrapping_add(i.extra), ctx.r[m])?,
        Op::StoreGbrDisp(size) => store(bus, size, ctx.gbr.wrapping_add(i.extra), ctx.r[0])?,

        Op::Ldc => {
            if let Some(sr) = i.a.special() {
                write_special(ctx, sr, ctx.r[m]);
            }
        }
        Op::LdcPostInc => {
            let value = read::<u32, B>(bus, ctx.r[m])?;
            ctx.r[m] = ctx.r[m].wrapping_add(4);
            if let Some(sr) = i.a.special() {
                write_special(ctx, sr, value);
            }
        }
        Op::Stc => {
            if let Some(sr) = i.b.special() {
                ctx.r[n] = read_special(ctx, sr);
            }
        }
        Op::StcPreDec => {
            let value = i.b.special().map_or(0, |sr| read_special(ctx, sr));
            let addr = ctx.r[n].wrapping_sub(4);
            write(bus, addr, value)?;
            ctx.r[n] = addr;
        }

        // ---------------- Arithmetic ----------------
        Op::Add => ctx.r[n] = ctx.r[n].wrapping_add(src(ctx)),
        Op::Addc => {
            let (v, t) = sh4_addc(ctx.t(), ctx.r[n], ctx.r[m]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Addv => {
            let (v, t) = sh4_addv(ctx.r[n], ctx.r[m]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Sub => ctx.r[n] = ctx.r[n].wrapping_sub(ctx.r[m]),
        Op::Subc => {
            let (v, t) = sh4_subc(ctx.t(), ctx.r[n], ctx.r[m]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Subv => {
            let (v, t) = sh4_subv(ctx.r[n], ctx.r[m]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Neg => ctx.r[n] = 0u32.wrapping_sub(ctx.r[m]),
        Op::Negc => {
            let (v, t) = sh4_negc(ctx.t(), ctx.r[m]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Dt => {
            ctx.r[n] = ctx.r[n].wrapping_sub(1);
            ctx.set_t(ctx.r[n] == 0);
        }

        // ---------------- Logic ----------------
        Op::And => ctx.r[n] &= src(ctx),
        Op::Or => ctx.r[n] |= src(ctx),
        Op::Xor => ctx.r[n] ^= src(ctx),
        Op::Not => ctx.r[n] = !ctx.r[m],
        Op::Tst => {
            let t = ctx.r[n] & src(ctx) == 0;
            ctx.set_t(t);
        }
        Op::AndB | Op::OrB | Op::XorB | Op::TstB => {
            let addr = ctx.gbr.wrapping_add(ctx.r[0]);
            let value = read::<u8, B>(bus, addr)? as u32;
            let imm = i.extra;
            match i.op {
                Op::AndB => write(bus, addr, (value & imm) as u8)?,
                Op::OrB => write(bus, addr, (value | imm) as u8)?,
                Op::XorB => write(bus, addr, (value ^ imm) as u8)?,
                _ => ctx.set_t(value & imm == 0),
            }
        }

        Op::ExtuB => ctx.r[n] = ctx.r[m] as u8 as u32,
        Op::ExtuW => ctx.r[n] = ctx.r[m] as u16 as u32,
        Op::ExtsB => ctx.r[n] = ctx.r[m] as i8 as u32,
        Op::ExtsW => ctx.r[n] = ctx.r[m] as i16 as u32,
        Op::SwapB => ctx.r[n] = sh4_swapb(ctx.r[m]),
        Op::SwapW => ctx.r[n] = sh4_swapw(ctx.r[m]),
        Op::Xtrct => ctx.r[n] = sh4_xtrct(ctx.r[n], ctx.r[m]),

        // ---------------- Compare ----------------
        Op::CmpEq => {
            let t = ctx.r[n] == src(ctx);
            ctx.set_t(t);
        }
        Op::CmpHs => ctx.set_t(ctx.r[n] >= ctx.r[m]),
        Op::CmpGe => ctx.set_t(ctx.r[n] as i32 >= ctx.r[m] as i32),
        Op::CmpHi => ctx.set_t(ctx.r[n] > ctx.r[m]),
        Op::CmpGt => ctx.set_t(ctx.r[n] as i32 > ctx.r[m] as i32),
        Op::CmpPz => ctx.set_t(ctx.r[n] as i32 >= 0),
        Op::CmpPl => ctx.set_t(ctx.r[n] as i32 > 0),
        Op::CmpStr => ctx.set_t(sh4_cmp_str(ctx.r[n], ctx.r[m])),

        // ---------------- Multiply / divide ----------------
        Op::Div0s => {
            let (q, mm, t) = sh4_div0s(ctx.r[n], ctx.r[m]);
            ctx.sr.set_q(q);
            ctx.sr.set_m(mm);
            ctx.set_t(t);
        }
        Op::Div0u => {
            ctx.sr.set_q(false);
            ctx.sr.set_m(false);
            ctx.set_t(false);
        }
        Op::Div1 => {
            let (v, q, t) = sh4_div1(ctx.sr.q(), ctx.sr.m(), ctx.t(), ctx.r[n], ctx.r[m], n == m);
            ctx.r[n] = v;
            ctx.sr.set_q(q);
            ctx.set_t(t);
        }
        Op::DmulsL => ctx.set_mac(sh4_dmuls(ctx.r[n], ctx.r[m])),
        Op::DmuluL => ctx.set_mac(sh4_dmulu(ctx.r[n], ctx.r[m])),
        Op::MulL => ctx.set_macl(ctx.r[n].wrapping_mul(ctx.r[m])),
        Op::MulsW => ctx.set_macl(sh4_mulsw(ctx.r[n], ctx.r[m])),
        Op::MuluW => ctx.set_macl(sh4_muluw(ctx.r[n], ctx.r[m])),
        Op::MacL => {
            let rn = read::<u32, B>(bus, ctx.r[n])?;
            let rm_addr = if n == m { ctx.r[n].wrapping_add(4) } else { ctx.r[m] };
            let rm = read::<u32, B>(bus, rm_addr)?;
            ctx.r[n] = ctx.r[n].wrapping_add(4);
            ctx.r[m] = ctx.r[m].wrapping_add(4);
            let s = ctx.sr.s();
            ctx.set_mac(sh4_mac_l(ctx.mac(), s, rn, rm));
        }
        Op::MacW => {
            let rn = read::<u16, B>(bus, ctx.r[n])?;
            let rm_addr = if n == m { ctx.r[n].wrapping_add(2) } else { ctx.r[m] };
            let rm = read::<u16, B>(bus, rm_addr)?;
            ctx.r[n] = ctx.r[n].wrapping_add(2);
            ctx.r[m] = ctx.r[m].wrapping_add(2);
            let s = ctx.sr.s();
            ctx.set_mac(sh4_mac_w(ctx.mac(), s, rn, rm));
        }

        // ---------------- Shifts ----------------
        Op::Shll | Op::Shal => {
            ctx.set_t(ctx.r[n] & 0x8000_0000 != 0);
            ctx.r[n] <<= 1;
        }
        Op::Shlr => {
            ctx.set_t(ctx.r[n] & 1 != 0);
            ctx.r[n] >>= 1;
        }
        Op::Shar => {
            ctx.set_t(ctx.r[n] & 1 != 0);
            ctx.r[n] = ((ctx.r[n] as i32) >> 1) as u32;
        }
        Op::ShllN => ctx.r[n] <<= i.extra,
        Op::ShlrN => ctx.r[n] >>= i.extra,
        Op::Shad => ctx.r[n] = sh4_shad(ctx.r[n], ctx.r[m]),
        Op::Shld => ctx.r[n] = sh4_shld(ctx.r[n], ctx.r[m]),
        Op::Rotl => {
            ctx.set_t(ctx.r[n] & 0x8000_0000 != 0);
            ctx.r[n] = ctx.r[n].rotate_left(1);
        }
        Op::Rotr => {
            ctx.set_t(ctx.r[n] & 1 != 0);
            ctx.r[n] = ctx.r[n].rotate_right(1);
        }
        Op::Rotcl => {
            let (v, t) = sh4_rotcl(ctx.t(), ctx.r[n]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }
        Op::Rotcr => {
            let (v, t) = sh4_rotcr(ctx.t(), ctx.r[n]);
            ctx.r[n] = v;
            ctx.set_t(t);
        }

        // ---------------- Flags ----------------
        Op::Movt => ctx.r[n] = ctx.sr_t & 1,
        Op::Clrt => ctx.set_t(false),
        Op::Sett => ctx.set_t(true),
        Op::Clrs => ctx.sr.set_s(false),
        Op::Sets => ctx.sr.set_s(true),
        Op::Clrmac => ctx.set_mac(0),
        Op::Tas => {
            let addr = ctx.r[n];
            let value = read::<u8, B>(bus, addr)?;
            write(bus, addr, value | 0x80)?;
            ctx.set_t(value == 0);
        }

        // ---------------- Branches ----------------
        Op::Bt => return Ok(if ctx.t() { Flow::Jump(i.extra) } else { Flow::Next }),
        Op::Bf => return Ok(if !ctx.t() { Flow::Jump(i.extra) } else { Flow::Next }),
        Op::BtS => return Ok(Flow::Delayed { taken: ctx.t(), target: i.extra }),
        Op::BfS => return Ok(Flow::Delayed { taken: !ctx.t(), target: i.extra }),
        Op::Bra => return Ok(Flow::Delayed { taken: true, target: i.extra }),
        Op::Bsr => {
            ctx.pr = i.pc.wrapping_add(4);
            return Ok(Flow::Delayed { taken: true, target: i.extra });
        }
        Op::Braf | Op::Bsrf => {
            let target = i.pc.wrapping_add(4).wrapping_add(ctx.r[n]);
            if i.op == Op::Bsrf {
                ctx.pr = i.pc.wrapping_add(4);
            }
            return Ok(Flow::Delayed { taken: true, target });
        }
        Op::Jmp | Op::Jsr => {
            let target = ctx.r[n];
            if i.op == Op::Jsr {
                ctx.pr = i.pc.wrapping_add(4);
            }
            return Ok(Flow::Delayed { taken: true, target });
        }
        Op::Rts => return Ok(Flow::Delayed { taken: true, target: ctx.pr }),
        Op::Rte => {
            let target = ctx.spc;
            ctx.set_sr_full(ctx.ssr);
            return Ok(Flow::Delayed { taken: true, target });
        }

        // ---------------- System ----------------
        Op::Trapa => return Err(Sh4Exception::Trap(i.extra as u8)),
        Op::Sleep => return Ok(Flow::Sleep),
        Op::Ldtlb | Op::Ocbi | Op::Ocbp | Op::Ocbwb => {}
        Op::Pref => {
            log::trace!("sh4: pref {:#010x}", ctx.r[n]);
        }
        Op::Movca => write(bus, ctx.r[n], ctx.r[0])?,

        // ---------------- FPU ----------------
        Op::Fadd | Op::Fsub | Op::Fmul | Op::Fdiv => {
            if pr {
                let (a, b) = (ctx.dr(n >> 1), ctx.dr(m >> 1));
                let v = match i.op {
                    Op::Fadd => a + b,
                    Op::Fsub => a - b,
                    Op::Fmul => a * b,
                    _ => a / b,
                };
                ctx.set_dr(n >> 1, v);
            } else {
                let (a, b) = (ctx.fr(n), ctx.fr(m));
                let v = match i.op {
                    Op::Fadd => a + b,
                    Op::Fsub => a - b,
                    Op::Fmul => a * b,
                    _ => a / b,
                };
                ctx.set_fr(n, v);
            }
        }
        Op::FcmpEq | Op::FcmpGt => {
            let t = if pr {
                let (a, b) = (ctx.dr(n >> 1), ctx.dr(m >> 1));
                if i.op == Op::FcmpEq { a == b } else { a > b }
            } else {
                let (a, b) = (ctx.fr(n), ctx.fr(m));
                if i.op == Op::FcmpEq { a == b } else { a > b }
            };
            ctx.set_t(t);
        }
        Op::Fmac => {
            let v = sh4_fmac(ctx.fr(0), ctx.fr(m), ctx.fr(n));
            ctx.set_fr(n, v);
        }
        Op::Fmov => {
            if sz {
                let v = pair_bits(ctx, m);
                set_pair_bits(ctx, n, v);
            } else {
                ctx.set_fr_bits(n, ctx.fr_bits(m));
            }
        }
        Op::FLoad | Op::FLoadPostInc | Op::FLoadIdxR0 => {
            let addr = match i.op {
                Op::FLoadIdxR0 => ctx.r[0].wrapping_add(ctx.r[m]),
                _ => ctx.r[m],
            };
            let step = if sz {
                let v = read::<u64, B>(bus, addr)?;
                set_pair_bits(ctx, n, v);
                8
            } else {
                let v = read::<u32, B>(bus, addr)?;
                ctx.set_fr_bits(n, v);
                4
            };
            if i.op == Op::FLoadPostInc {
                ctx.r[m] = ctx.r[m].wrapping_add(step);
            }
        }
        Op::FStore | Op::FStorePreDec | Op::FStoreIdxR0 => {
            // `a` is the base register, `b` the FP source.
            let step = if sz { 8 } else { 4 };
            let addr = match i.op {
                Op::FStoreIdxR0 => ctx.r[0].wrapping_add(ctx.r[n]),
                Op::FStorePreDec => ctx.r[n].wrapping_sub(step),
                _ => ctx.r[n],
            };
            if sz {
                write(bus, addr, pair_bits(ctx, m))?;
            } else {
                write(bus, addr, ctx.fr_bits(m))?;
            }
            if i.op == Op::FStorePreDec {
                ctx.r[n] = addr;
            }
        }
        Op::Fldi0 => ctx.set_fr(n, 0.0),
        Op::Fldi1 => ctx.set_fr(n, 1.0),
        Op::Flds => ctx.fpul = ctx.fr_bits(m),
        Op::Fsts => ctx.set_fr_bits(n, ctx.fpul),
        Op::Float => {
            if pr {
                ctx.set_dr(n >> 1, ctx.fpul as i32 as f64);
            } else {
                ctx.set_fr(n, ctx.fpul as i32 as f32);
            }
        }
        Op::Ftrc => {
            ctx.fpul = if pr {
                sh4_ftrc_d(ctx.dr(m >> 1))
            } else {
                sh4_ftrc(ctx.fr(m))
            };
        }
        Op::Fneg | Op::Fabs => {
            // Sign bit of DRn lives in the high word, fr[2n].
            let reg = if pr { n & !1 } else { n };
            let bits = ctx.fr_bits(reg);
            let bits = if i.op == Op::Fneg { bits ^ 0x8000_0000 } else { bits & 0x7FFF_FFFF };
            ctx.set_fr_bits(reg, bits);
        }
        Op::Fsqrt => {
            if pr {
                ctx.set_dr(n >> 1, ctx.dr(n >> 1).sqrt());
            } else {
                ctx.set_fr(n, ctx.fr(n).sqrt());
            }
        }
        Op::Fsrra => ctx.set_fr(n, sh4_fsrra(ctx.fr(n))),
        Op::Fsca => {
            let (sin, cos) = sh4_fsca(ctx.fpul);
            ctx.set_fr(n & !1, sin);
            ctx.set_fr(n | 1, cos);
        }
        Op::Fipr => {
            let v = sh4_fipr(fv(ctx, n), fv(ctx, m));
            ctx.set_fr(n + 3, v);
        }
        Op::Ftrv => {
            let xf = unsafe { ctx.xf.f32s };
            let out = sh4_ftrv(&xf, fv(ctx, n));
            for (k, v) in out.into_iter().enumerate() {
                ctx.set_fr(n + k, v);
            }
        }
        Op::Fcnvds => ctx.fpul = (ctx.dr(m >> 1) as f32).to_bits(),
        Op::Fcnvsd => ctx.set_dr(n >> 1, f32::from_bits(ctx.fpul) as f64),
        Op::Frchg => ctx.set_fpscr(ctx.fpscr.full() ^ (1 << 21)),
        Op::Fschg => ctx.set_fpscr(ctx.fpscr.full() ^ (1 << 20)),
    }

    Ok(Flow::Next)
}

/// Runs one unit starting at `instr`. For delayed branches `slot` is the
/// decoded slot; when it is missing the slot is fetched from `bus`.
pub fn execute_unit<B: MemoryBus + ?Sized>(
    ctx: &mut Sh4Context,
    bus: &mut B,
    instr: &Instr,
    slot: Option<&Instr>,
) -> Result<Exit, Raised> {
    let pc = instr.pc;
    let raise = |exception: Sh4Exception| Raised {
        exception,
        // trapa resumes after itself.
        pc: if matches!(exception, Sh4Exception::Trap(_)) { pc.wrapping_add(2) } else { pc },
    };

    check_allowed(ctx, instr, false).map_err(raise)?;
    let (old_pr, old_sr) = (ctx.pr, ctx.sr_full());
    match exec_op(ctx, bus, instr).map_err(raise)? {
        Flow::Next => {
            ctx.pc = pc.wrapping_add(2);
            Ok(Exit::Next)
        }
        Flow::Jump(target) => {
            ctx.pc = target;
            Ok(Exit::Jump)
        }
        Flow::Sleep => {
            ctx.pc = pc.wrapping_add(2);
            Ok(Exit::Sleep)
        }
        Flow::Delayed { taken, target } => {
            let slot_pc = pc.wrapping_add(2);
            let fetched;
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    fetched = decode(slot_pc, read_mem::<u16, B>(bus, slot_pc));
                    &fetched
                }
            };
            // The slot sees the branch's PR and SR, but they only stick
            // once the slot retires.
            if let Err(exception) = exec_slot(ctx, bus, slot) {
                match instr.op {
                    Op::Bsr | Op::Bsrf | Op::Jsr => ctx.pr = old_pr,
                    Op::Rte => ctx.set_sr_full(old_sr),
                    _ => {}
                }
                // Slot exceptions report the branch address.
                return Err(Raised { exception, pc });
            }
            ctx.pc = if taken { target } else { pc.wrapping_add(4) };
            Ok(Exit::Jump)
        }
    }
}

fn exec_slot<B: MemoryBus + ?Sized>(ctx: &mut Sh4Context, bus: &mut B, slot: &Instr) -> Exec<()> {
    check_allowed(ctx, slot, true)?;
    match exec_op(ctx, bus, slot)? {
        Flow::Next => Ok(()),
        // Everything else is slot-illegal and rejected above.
        _ => Err(Sh4Exception::SlotIllegalInstruction),
    }
}

/// Runs a block unit by unit. `boundary` is asked before every unit but the
/// first and stops the block when it returns false.
pub fn execute_block<B: MemoryBus + ?Sized>(
    ctx: &mut Sh4Context,
    bus: &mut B,
    block: &Block,
    mut boundary: impl FnMut() -> bool,
) -> BlockExit {
    let instrs = &block.instrs;
    let mut idx = 0;
    while idx < instrs.len() {
        if idx > 0 && !boundary() {
            return BlockExit::Stopped;
        }
        let instr = &instrs[idx];
        let slot = if instr.is_delayed() { instrs.get(idx + 1) } else { None };
        match execute_unit(ctx, bus, instr, slot) {
            Ok(Exit::Next) => {}
            Ok(Exit::Jump) => return BlockExit::Completed,
            Ok(Exit::Sleep) => return BlockExit::Sleep,
            Err(raised) => return BlockExit::Raised(raised),
        }
        idx += 1 + slot.is_some() as usize;
    }
    BlockExit::Completed
}
