//! Block engine: decodes guest code into cached IR blocks and runs them.

use std::sync::Arc;

use vmem::{FaultRegistration, VirtualMemory};

use crate::block_cache::{BlockCache, LookupTable};
use crate::context::Sh4Context;
use crate::engine::{CpuState, EngineCore, EngineError, RunControl, Sh4Engine, forward_engine_core};
use crate::exceptions::{ExceptionRegs, InterruptController, Sh4Exception};
use crate::executor::{BlockExit, Raised, execute_block};
use crate::ir::Block;
use crate::sh4mem::{MemoryBus, Sh4Bus};
use crate::smc::CodeGuard;

pub struct Sh4IrInterpreter<'vm, B: MemoryBus = Sh4Bus<'vm>> {
    core: EngineCore<'vm, B>,
    cache: BlockCache<'vm>,
    last_block: Option<Arc<Block>>,
    faults: Vec<u32>,
    _guard_registration: Option<FaultRegistration>,
}

/// Applies logged code writes to the cache. Returns false when nothing
/// was pending.
fn apply_faults(cache: &mut BlockCache<'_>, faults: &mut Vec<u32>) -> bool {
    let Some(guard) = cache.guard().cloned() else {
        return false;
    };
    if guard.log().is_empty() {
        return false;
    }
    if guard.log().drain_into(faults) {
        log::debug!("sh4ir: fault log overflowed, resetting the block cache");
        cache.reset();
    } else {
        for &offset in faults.iter() {
            // The page is writable again, so nothing on it is guarded.
            cache.invalidate_ram_page(offset);
        }
    }
    faults.clear();
    true
}

impl<'vm, B: MemoryBus> Sh4IrInterpreter<'vm, B> {
    pub fn new(
        vm: &'vm VirtualMemory,
        bus: B,
        interrupts: Arc<InterruptController>,
    ) -> Result<Self, EngineError> {
        let core = EngineCore::new(vm, bus, interrupts)?;
        let mut cache = BlockCache::new(vm.backing_layout().ram.size, vm.page_size());

        let (base, size) = core.claim().lookup_table();
        match LookupTable::new(vm, base, size) {
            Some(table) => cache.attach_lookup(table),
            None => log::info!("sh4ir: no lookup table reserved, using the hash map only"),
        }

        let guard = CodeGuard::new(vm);
        let registration = match vmem::fault::register(guard.clone()) {
            Ok(registration) => {
                cache.attach_guard(guard);
                Some(registration)
            }
            Err(err) => {
                log::warn!("sh4ir: code pages stay writable, blocks are verified on reuse: {err}");
                None
            }
        };

        Ok(Self {
            core,
            cache,
            last_block: None,
            faults: Vec::with_capacity(crate::smc::FAULT_LOG_CAPACITY),
            _guard_registration: registration,
        })
    }

    pub fn bus(&self) -> &B {
        &self.core.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.core.bus
    }

    pub fn cache(&self) -> &BlockCache<'vm> {
        &self.cache
    }

    /// The block the last `step` ran, if it ran one.
    pub fn last_executed_block(&self) -> Option<&Arc<Block>> {
        self.last_block.as_ref()
    }

    /// Decodes (or fetches) the block at `pc` without running it.
    pub fn build_block(&mut self, pc: u32) -> Arc<Block> {
        apply_faults(&mut self.cache, &mut self.faults);
        self.cache.build_block(pc, &mut self.core.bus)
    }

    fn step_block(
        core: &mut EngineCore<'vm, B>,
        cache: &mut BlockCache<'vm>,
        last_block: &mut Option<Arc<Block>>,
        faults: &mut Vec<u32>,
    ) -> Result<(), EngineError> {
        if !core.begin_step()? {
            return Ok(());
        }
        apply_faults(cache, faults);

        let (ctx, bus) = core.parts();
        let pc = ctx.pc;
        if pc & 1 != 0 {
            return core.raise(Raised {
                exception: Sh4Exception::AddressErrorRead(pc),
                pc,
            });
        }

        let block = cache.build_block(pc, bus);
        *last_block = Some(Arc::clone(&block));
        log::trace!("sh4ir: block {pc:#010x} ({} instrs)", block.len());

        // A store inside the block may have hit its own code.
        let exit = execute_block(ctx, bus, &block, || {
            !apply_faults(cache, faults) || cache.is_live(&block)
        });

        match exit {
            BlockExit::Completed => {}
            BlockExit::Sleep => core.sleeping = true,
            BlockExit::Stopped => {
                log::debug!("sh4ir: block {pc:#010x} invalidated while running");
            }
            BlockExit::Raised(raised) => core.raise(raised)?,
        }
        Ok(())
    }
}

impl<'vm, B: MemoryBus> Sh4Engine for Sh4IrInterpreter<'vm, B> {
    forward_engine_core!();

    fn run(&mut self) -> Result<(), EngineError> {
        let Self {
            core,
            cache,
            last_block,
            faults,
            ..
        } = self;
        core.run_with(|core| Self::step_block(core, cache, last_block, faults))
    }

    fn step(&mut self) -> Result<(), EngineError> {
        Self::step_block(&mut self.core, &mut self.cache, &mut self.last_block, &mut self.faults)
    }

    fn reset_cache(&mut self) {
        if let Some(guard) = self.cache.guard() {
            // Everything goes anyway.
            guard.log().drain_into(&mut self.faults);
            self.faults.clear();
        }
        self.cache.reset();
        self.last_block = None;
    }

    fn invalidate_block(&mut self, addr: u32) {
        self.cache.invalidate_block(addr);
    }
}

impl<B: MemoryBus> Drop for Sh4IrInterpreter<'_, B> {
    fn drop(&mut self) {
        // Nobody is left to handle writes to the pages this engine locked.
        if let Some(guard) = self.cache.guard() {
            guard.unprotect_all();
        }
    }
}
