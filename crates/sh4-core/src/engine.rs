//! The CPU engine contract and the state both engines share.

use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use vmem::{ContextClaim, VirtualMemory};

use crate::context::Sh4Context;
use crate::exceptions::{ExceptionRegs, InterruptController, accept_interrupt, enter_exception};
use crate::executor::Raised;
use crate::sh4mem::MemoryBus;
use crate::state::{self, StateError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("exception {expevt:#05x} at {pc:#010x} while exceptions are blocked")]
    ExceptionWhileBlocked { expevt: u32, pc: u32 },

    #[error("the cpu context is already owned by another engine")]
    ContextBusy,

    #[error("engine used before init")]
    NotInitialized,

    #[error("save state: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Vmem(#[from] vmem::VmemError),

    #[error(transparent)]
    Bus(#[from] crate::sh4mem::BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Uninitialized,
    Ready,
    Running,
    Terminated,
}

/// Clonable handle on an engine's running flag.
#[derive(Debug, Clone)]
pub struct RunControl(Arc<AtomicBool>);

impl RunControl {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub trait Sh4Engine {
    /// Brings the context to its power-on state.
    fn init(&mut self) -> Result<(), EngineError>;
    fn reset(&mut self, hard: bool);
    fn start(&mut self);
    fn stop(&mut self);
    /// Runs until stopped or a fatal guest condition.
    fn run(&mut self) -> Result<(), EngineError>;
    /// One instruction (with its slot) or one block, depending on the engine.
    fn step(&mut self) -> Result<(), EngineError>;
    fn reset_cache(&mut self);
    fn invalidate_block(&mut self, addr: u32);
    fn is_cpu_running(&self) -> bool;
    fn term(&mut self);
    fn state(&self) -> CpuState;

    fn context(&self) -> &Sh4Context;
    fn context_mut(&mut self) -> &mut Sh4Context;
    fn exception_regs(&self) -> ExceptionRegs;
    fn run_control(&self) -> RunControl;
    fn interrupts(&self) -> Arc<InterruptController>;
    /// Whether the CPU is idle in `sleep` waiting for an interrupt.
    fn is_sleeping(&self) -> bool;

    fn load_state(&mut self, reader: &mut dyn Read) -> Result<(), EngineError>;
    fn save_state(&self, writer: &mut dyn Write) -> Result<(), EngineError>;
}

/// State and plumbing common to both engines. The context lives in the
/// context area of the virtual memory, right below the guest base.
pub(crate) struct EngineCore<'vm, B> {
    ctx: NonNull<Sh4Context>,
    claim: ContextClaim<'vm>,
    pub(crate) bus: B,
    pub(crate) regs: ExceptionRegs,
    pub(crate) interrupts: Arc<InterruptController>,
    running: Arc<AtomicBool>,
    pub(crate) sleeping: bool,
    initialized: bool,
    terminated: bool,
}

// The context pointer is owned through the claim, nothing else aliases it.
unsafe impl<B: Send> Send for EngineCore<'_, B> {}

impl<'vm, B: MemoryBus> EngineCore<'vm, B> {
    pub(crate) fn new(
        vm: &'vm VirtualMemory,
        bus: B,
        interrupts: Arc<InterruptController>,
    ) -> Result<Self, EngineError> {
        let claim = vm.claim_context().ok_or(EngineError::ContextBusy)?;
        let raw = claim.context_ptr(Sh4Context::SIZE)?.cast::<Sh4Context>();
        let ctx = NonNull::new(raw).ok_or(EngineError::ContextBusy)?;
        // The area is plain memory of the right size and alignment.
        unsafe { ctx.as_ptr().write(Sh4Context::default()) };
        log::debug!("sh4: context at {:p}, guest base {:p}", raw, vm.vmem_base());

        Ok(Self {
            ctx,
            claim,
            bus,
            regs: ExceptionRegs::default(),
            interrupts,
            running: Arc::new(AtomicBool::new(false)),
            sleeping: false,
            initialized: false,
            terminated: false,
        })
    }

    pub(crate) fn vm(&self) -> &'vm VirtualMemory {
        self.claim.vm()
    }

    pub(crate) fn claim(&self) -> &ContextClaim<'vm> {
        &self.claim
    }

    pub(crate) fn ctx(&self) -> &Sh4Context {
        unsafe { self.ctx.as_ref() }
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut Sh4Context {
        unsafe { self.ctx.as_mut() }
    }

    /// Context and bus borrowed together.
    pub(crate) fn parts(&mut self) -> (&mut Sh4Context, &mut B) {
        (unsafe { self.ctx.as_mut() }, &mut self.bus)
    }

    pub(crate) fn init(&mut self) -> Result<(), EngineError> {
        if self.warn_terminated("init") {
            return Ok(());
        }
        self.ctx_mut().reset(true);
        self.regs = ExceptionRegs::default();
        self.sleeping = false;
        self.initialized = true;
        log::info!("sh4: initialized, pc {:#010x}", self.ctx().pc);
        Ok(())
    }

    pub(crate) fn reset(&mut self, hard: bool) {
        if self.warn_terminated("reset") {
            return;
        }
        self.ctx_mut().reset(hard);
        if hard {
            self.regs = ExceptionRegs::default();
        }
        self.sleeping = false;
        log::info!("sh4: {} reset", if hard { "hard" } else { "soft" });
    }

    pub(crate) fn warn_terminated(&self, what: &str) -> bool {
        if self.terminated {
            log::warn!("sh4: {what} on a terminated engine ignored");
        }
        self.terminated
    }

    pub(crate) fn start(&mut self) {
        if !self.warn_terminated("start") {
            self.running.store(true, Ordering::Release);
        }
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn term(&mut self) {
        self.stop();
        self.terminated = true;
        log::info!("sh4: terminated");
    }

    pub(crate) fn state(&self) -> CpuState {
        if self.terminated {
            CpuState::Terminated
        } else if !self.initialized {
            CpuState::Uninitialized
        } else if self.is_running() {
            CpuState::Running
        } else {
            CpuState::Ready
        }
    }

    pub(crate) fn run_control(&self) -> RunControl {
        RunControl(Arc::clone(&self.running))
    }

    /// Common prologue of a step: takes pending interrupts and reports
    /// whether there is anything to execute.
    pub(crate) fn begin_step(&mut self) -> Result<bool, EngineError> {
        if self.warn_terminated("step") {
            return Ok(false);
        }
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        let ctx = unsafe { self.ctx.as_mut() };
        if accept_interrupt(ctx, &mut self.regs, &self.interrupts) {
            self.sleeping = false;
        }
        Ok(!self.sleeping)
    }

    /// Delivers a guest exception.
    pub(crate) fn raise(&mut self, raised: Raised) -> Result<(), EngineError> {
        let ctx = unsafe { self.ctx.as_mut() };
        enter_exception(ctx, &mut self.regs, raised.exception, raised.pc)
    }

    /// Drives `step` while the running flag is set.
    pub(crate) fn run_with(
        &mut self,
        mut step: impl FnMut(&mut Self) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        if self.warn_terminated("run") {
            return Ok(());
        }
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        log::debug!("sh4: run from {:#010x}", self.ctx().pc);
        while self.is_running() {
            if let Err(err) = step(self) {
                self.stop();
                log::error!("sh4: stopped: {err}");
                return Err(err);
            }
            if self.sleeping && !self.interrupts.is_pending() {
                std::thread::yield_now();
            }
        }
        log::debug!("sh4: run ended at {:#010x}", self.ctx().pc);
        Ok(())
    }

    pub(crate) fn load_state(&mut self, reader: &mut dyn Read) -> Result<(), EngineError> {
        state::deserialize(self.ctx_mut(), reader)?;
        self.sleeping = false;
        Ok(())
    }

    pub(crate) fn save_state(&self, writer: &mut dyn Write) -> Result<(), EngineError> {
        state::serialize(self.ctx(), writer)?;
        Ok(())
    }
}

/// Forwards the engine-independent part of [`Sh4Engine`] to the core.
macro_rules! forward_engine_core {
    () => {
        fn init(&mut self) -> Result<(), EngineError> {
            self.core.init()?;
            self.reset_cache();
            Ok(())
        }

        fn reset(&mut self, hard: bool) {
            self.core.reset(hard);
            self.reset_cache();
        }

        fn start(&mut self) {
            self.core.start();
        }

        fn stop(&mut self) {
            self.core.stop();
        }

        fn is_cpu_running(&self) -> bool {
            self.core.is_running()
        }

        fn term(&mut self) {
            self.core.term();
        }

        fn state(&self) -> CpuState {
            self.core.state()
        }

        fn context(&self) -> &Sh4Context {
            self.core.ctx()
        }

        fn context_mut(&mut self) -> &mut Sh4Context {
            self.core.ctx_mut()
        }

        fn exception_regs(&self) -> ExceptionRegs {
            self.core.regs
        }

        fn run_control(&self) -> RunControl {
            self.core.run_control()
        }

        fn interrupts(&self) -> Arc<InterruptController> {
            Arc::clone(&self.core.interrupts)
        }

        fn is_sleeping(&self) -> bool {
            self.core.sleeping
        }

        fn load_state(&mut self, reader: &mut dyn std::io::Read) -> Result<(), EngineError> {
            if self.core.warn_terminated("load_state") {
                return Ok(());
            }
            self.core.load_state(reader)?;
            self.reset_cache();
            Ok(())
        }

        fn save_state(&self, writer: &mut dyn std::io::Write) -> Result<(), EngineError> {
            self.core.save_state(writer)
        }
    };
}

pub(crate) use forward_engine_core;
