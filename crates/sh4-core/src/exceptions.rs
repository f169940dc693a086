//! Guest exception and interrupt entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::context::Sh4Context;
use crate::engine::EngineError;

pub const VECTOR_GENERAL: u32 = 0x100;
pub const VECTOR_INTERRUPT: u32 = 0x600;

const SR_BL: u32 = 1 << 28;
const SR_RB: u32 = 1 << 29;
const SR_MD: u32 = 1 << 30;

/// Exceptions raised by guest instructions. They are delivered to the guest
/// vector table, never to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sh4Exception {
    IllegalInstruction,
    SlotIllegalInstruction,
    AddressErrorRead(u32),
    AddressErrorWrite(u32),
    Trap(u8),
    FpuDisabled,
    SlotFpuDisabled,
}

impl Sh4Exception {
    pub const fn expevt(self) -> u32 {
        match self {
            Sh4Exception::AddressErrorRead(_) => 0x0E0,
            Sh4Exception::AddressErrorWrite(_) => 0x100,
            Sh4Exception::Trap(_) => 0x160,
            Sh4Exception::IllegalInstruction => 0x180,
            Sh4Exception::SlotIllegalInstruction => 0x1A0,
            Sh4Exception::FpuDisabled => 0x800,
            Sh4Exception::SlotFpuDisabled => 0x820,
        }
    }
}

/// Event registers living outside the CPU context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionRegs {
    pub tra: u32,
    pub expevt: u32,
    pub intevt: u32,
    pub tea: u32,
}

fn enter(ctx: &mut Sh4Context, spc: u32, vector: u32) {
    ctx.spc = spc;
    ctx.ssr = ctx.sr_full();
    // Saved before the bank switch below.
    ctx.sgr = ctx.r[15];
    ctx.set_sr_full(ctx.sr_full() | SR_MD | SR_RB | SR_BL);
    ctx.pc = ctx.vbr.wrapping_add(vector);
}

/// Redirects the guest to the general exception vector. `spc` is the
/// address execution resumes at after `rte`.
pub fn enter_exception(
    ctx: &mut Sh4Context,
    regs: &mut ExceptionRegs,
    exception: Sh4Exception,
    spc: u32,
) -> Result<(), EngineError> {
    if ctx.sr.bl() {
        return Err(EngineError::ExceptionWhileBlocked {
            expevt: exception.expevt(),
            pc: spc,
        });
    }

    match exception {
        Sh4Exception::Trap(imm) => regs.tra = (imm as u32) << 2,
        Sh4Exception::AddressErrorRead(addr) | Sh4Exception::AddressErrorWrite(addr) => regs.tea = addr,
        _ => {}
    }
    regs.expevt = exception.expevt();

    log::debug!(
        "sh4: {:?} at {:#010x}, vbr {:#010x}",
        exception,
        spc,
        ctx.vbr
    );
    enter(ctx, spc, VECTOR_GENERAL);
    Ok(())
}

/// Level-triggered interrupt lines keyed by INTEVT code. Devices raise and
/// clear their own lines; the CPU samples them at instruction or block
/// boundaries.
#[derive(Debug, Default)]
pub struct InterruptController {
    sources: Mutex<BTreeMap<u32, u8>>,
    pending: AtomicBool,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts `intevt` at priority `level` (1-15).
    pub fn raise(&self, intevt: u32, level: u8) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.insert(intevt, level.min(15));
        self.pending.store(true, Ordering::Release);
    }

    pub fn clear(&self, intevt: u32) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.remove(&intevt);
        self.pending.store(!sources.is_empty(), Ordering::Release);
    }

    /// Cheap check used on every boundary.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Highest priority asserted line. Ties go to the lowest INTEVT code.
    pub fn highest(&self) -> Option<(u32, u8)> {
        let sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources
            .iter()
            .fold(None, |best: Option<(u32, u8)>, (&evt, &level)| match best {
                Some((_, l)) if l >= level => best,
                _ => Some((evt, level)),
            })
    }
}

/// Takes the highest pending interrupt if SR allows it. Returns true when
/// the guest was redirected.
pub fn accept_interrupt(
    ctx: &mut Sh4Context,
    regs: &mut ExceptionRegs,
    interrupts: &InterruptController,
) -> bool {
    if !interrupts.is_pending() || ctx.sr.bl() {
        return false;
    }
    let Some((intevt, level)) = interrupts.highest() else {
        return false;
    };
    if u32::from(level) <= ctx.sr.imask() {
        return false;
    }

    log::trace!("sh4: interrupt {intevt:#x} level {level} at {:#010x}", ctx.pc);
    regs.intevt = intevt;
    let pc = ctx.pc;
    enter(ctx, pc, VECTOR_INTERRUPT);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_ctx() -> Sh4Context {
        let mut ctx = Sh4Context::new();
        ctx.vbr = 0x8C00_0000;
        ctx.pc = 0x8C01_0000;
        ctx.r[15] = 0x8CFF_0000;
        ctx.set_sr_full(0x0000_0001);
        ctx
    }

    #[test]
    fn trap_enters_general_vector() {
        let mut ctx = user_ctx();
        let mut regs = ExceptionRegs::default();
        enter_exception(&mut ctx, &mut regs, Sh4Exception::Trap(0x20), 0x8C01_0002).unwrap();

        assert_eq!(ctx.pc, 0x8C00_0100);
        assert_eq!(ctx.spc, 0x8C01_0002);
        assert_eq!(ctx.ssr, 0x0000_0001);
        assert_eq!(ctx.sgr, 0x8CFF_0000);
        assert_eq!(regs.tra, 0x80);
        assert_eq!(regs.expevt, 0x160);
        assert!(ctx.sr.md() && ctx.sr.rb() && ctx.sr.bl());
        // Only R0-R7 are banked.
        assert_eq!(ctx.r[15], 0x8CFF_0000);
    }

    #[test]
    fn exception_while_blocked_is_fatal() {
        let mut ctx = user_ctx();
        ctx.set_sr_full(0x7000_0000);
        let mut regs = ExceptionRegs::default();
        let err = enter_exception(&mut ctx, &mut regs, Sh4Exception::IllegalInstruction, 0x100)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ExceptionWhileBlocked { expevt: 0x180, pc: 0x100 }
        ));
    }

    #[test]
    fn interrupt_respects_imask_and_priority() {
        let ic = InterruptController::new();
        let mut ctx = user_ctx();
        ctx.set_sr_full(0x0000_0050); // imask 5
        let mut regs = ExceptionRegs::default();

        ic.raise(0x320, 5);
        assert!(!accept_interrupt(&mut ctx, &mut regs, &ic));

        ic.raise(0x360, 9);
        ic.raise(0x340, 9);
        assert_eq!(ic.highest(), Some((0x340, 9)));
        assert!(accept_interrupt(&mut ctx, &mut regs, &ic));
        assert_eq!(regs.intevt, 0x340);
        assert_eq!(ctx.pc, 0x8C00_0600);
        assert_eq!(ctx.spc, 0x8C01_0000);

        // BL is now set, nothing else gets in.
        assert!(!accept_interrupt(&mut ctx, &mut regs, &ic));

        ic.clear(0x320);
        ic.clear(0x340);
        ic.clear(0x360);
        assert!(!ic.is_pending());
    }
}
