//! Plain interpreter: fetch, decode and execute one instruction at a time.

use std::sync::Arc;

use vmem::VirtualMemory;

use crate::context::Sh4Context;
use crate::engine::{CpuState, EngineCore, EngineError, RunControl, Sh4Engine, forward_engine_core};
use crate::exceptions::{ExceptionRegs, InterruptController, Sh4Exception};
use crate::executor::{Exit, Raised, execute_unit};
use crate::sh4dec::{decode, format_disas};
use crate::sh4mem::{MemoryBus, Sh4Bus, read_mem};

pub struct Sh4Interpreter<'vm, B: MemoryBus = Sh4Bus<'vm>> {
    core: EngineCore<'vm, B>,
}

impl<'vm, B: MemoryBus> Sh4Interpreter<'vm, B> {
    pub fn new(
        vm: &'vm VirtualMemory,
        bus: B,
        interrupts: Arc<InterruptController>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            core: EngineCore::new(vm, bus, interrupts)?,
        })
    }

    pub fn bus(&self) -> &B {
        &self.core.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.core.bus
    }

    fn step_one(core: &mut EngineCore<'vm, B>) -> Result<(), EngineError> {
        if !core.begin_step()? {
            return Ok(());
        }

        let (ctx, bus) = core.parts();
        let pc = ctx.pc;
        if pc & 1 != 0 {
            return core.raise(Raised {
                exception: Sh4Exception::AddressErrorRead(pc),
                pc,
            });
        }

        let opcode = read_mem::<u16, B>(bus, pc);
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{pc:08x}: {}", format_disas(pc, opcode));
        }
        let instr = decode(pc, opcode);

        match execute_unit(ctx, bus, &instr, None) {
            Ok(Exit::Sleep) => core.sleeping = true,
            Ok(_) => {}
            Err(raised) => core.raise(raised)?,
        }
        Ok(())
    }
}

impl<'vm, B: MemoryBus> Sh4Engine for Sh4Interpreter<'vm, B> {
    forward_engine_core!();

    fn run(&mut self) -> Result<(), EngineError> {
        self.core.run_with(Self::step_one)
    }

    fn step(&mut self) -> Result<(), EngineError> {
        Self::step_one(&mut self.core)
    }

    // Nothing is cached.
    fn reset_cache(&mut self) {}

    fn invalidate_block(&mut self, _addr: u32) {}
}
