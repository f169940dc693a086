//! Both engines on a real guest address space.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use sh4_core::sh4mem::MmioHandler;
use sh4_core::{
    CpuState, EngineError, InterruptController, MemoryBus, RunControl, Sh4Bus, Sh4Engine,
    Sh4Interpreter, Sh4IrInterpreter, StateError, engine_vmem_config,
};
use vmem::{VirtualMemory, VmemConfig};

const CODE: u32 = 0x8C01_0000;
const VBR: u32 = 0x8C00_0000;

fn setup() -> VirtualMemory {
    common::init_logging();
    let mut vm = VirtualMemory::init(engine_vmem_config(VmemConfig::dreamcast())).expect("vmem");
    vm.create_default_mappings();
    vm
}

fn put(bus: &mut Sh4Bus<'_>, pc: u32, code: &[u16]) {
    for (i, &op) in code.iter().enumerate() {
        bus.write16(pc + 2 * i as u32, op);
    }
}

/// Privileged, interrupts unmasked, running at `pc`.
fn prepare(engine: &mut dyn Sh4Engine, pc: u32) {
    engine.init().expect("init");
    let ctx = engine.context_mut();
    ctx.set_sr_full(0x4000_0000);
    ctx.vbr = VBR;
    ctx.pc = pc;
}

trait GuestBus<'vm> {
    fn guest(&mut self) -> &mut Sh4Bus<'vm>;
}

impl<'vm> GuestBus<'vm> for Sh4Interpreter<'vm> {
    fn guest(&mut self) -> &mut Sh4Bus<'vm> {
        self.bus_mut()
    }
}

impl<'vm> GuestBus<'vm> for Sh4IrInterpreter<'vm> {
    fn guest(&mut self) -> &mut Sh4Bus<'vm> {
        self.bus_mut()
    }
}

fn interpreter(vm: &VirtualMemory) -> Sh4Interpreter<'_> {
    Sh4Interpreter::new(vm, Sh4Bus::new(vm), Arc::new(InterruptController::new())).expect("engine")
}

fn ir_engine(vm: &VirtualMemory) -> Sh4IrInterpreter<'_> {
    Sh4IrInterpreter::new(vm, Sh4Bus::new(vm), Arc::new(InterruptController::new())).expect("engine")
}

/// Records 32-bit writes and stops the CPU once `stop_at` is written.
struct Port {
    seen: Rc<RefCell<Vec<u32>>>,
    control: RunControl,
    stop_at: u32,
}

impl MmioHandler for Port {
    fn read8(&mut self, _offset: u32) -> u8 {
        0
    }
    fn read16(&mut self, _offset: u32) -> u16 {
        0
    }
    fn read32(&mut self, _offset: u32) -> u32 {
        0
    }
    fn write8(&mut self, _offset: u32, _value: u8) {}
    fn write16(&mut self, _offset: u32, _value: u16) {}
    fn write32(&mut self, _offset: u32, value: u32) {
        self.seen.borrow_mut().push(value);
        if value >= self.stop_at {
            self.control.stop();
        }
    }
}

fn counting_loop<'vm, E: Sh4Engine + GuestBus<'vm>>(engine: &mut E) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let port = Port {
        seen: Rc::clone(&seen),
        control: engine.run_control(),
        stop_at: 3,
    };
    let bus = engine.guest();
    bus.register_mem_handler(0xBF00_0000, 0xBFFF_FFFF, 0x00FF_FFFF, Box::new(port))
        .expect("handler slot");
    put(
        bus,
        CODE,
        &[
            0xD102, // mov.l @(8,pc),r1
            0x7001, // add #1,r0
            0x2102, // mov.l r0,@r1
            0xAFFC, // bra CODE+2
            0x0009, // nop
            0x0009,
            0x0000, // .long 0xBF000000
            0xBF00,
        ],
    );

    prepare(engine, CODE);
    engine.context_mut().r[0] = 0;
    engine.start();
    assert_eq!(engine.state(), CpuState::Running);
    engine.run().expect("run");

    assert!(!engine.is_cpu_running());
    assert_eq!(engine.state(), CpuState::Ready);
    assert_eq!(engine.context().r[0], 3);
    assert_eq!(*seen.borrow(), [1, 2, 3]);
}

#[test]
fn interpreter_runs_until_stopped() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    counting_loop(&mut engine);
    // One instruction per step, so it stops right after the store.
    assert_eq!(engine.context().pc, CODE + 6);
}

#[test]
fn ir_engine_runs_until_stopped() {
    let vm = setup();
    let mut engine = ir_engine(&vm);
    counting_loop(&mut engine);
    // The block finishes its branch before the flag is checked.
    assert_eq!(engine.context().pc, CODE + 2);
}

#[test]
fn step_before_init_fails() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    assert_eq!(engine.state(), CpuState::Uninitialized);
    assert!(matches!(engine.step(), Err(EngineError::NotInitialized)));
}

#[test]
fn init_is_a_hard_reset() {
    let vm = setup();
    let mut engine = ir_engine(&vm);
    engine.context_mut().r[4] = 7;
    engine.init().unwrap();
    let ctx = engine.context();
    assert_eq!(ctx.pc, 0xA000_0000);
    assert_eq!(ctx.sr_full(), 0x7000_00F0);
    assert_eq!(ctx.fpscr.full(), 0x0004_0001);
    assert_eq!(ctx.r[4], 0);
    assert_eq!(engine.state(), CpuState::Ready);
}

#[test]
fn one_context_per_address_space() {
    let vm = setup();
    let first = interpreter(&vm);
    let second = Sh4IrInterpreter::new(&vm, Sh4Bus::new(&vm), Arc::new(InterruptController::new()));
    assert!(matches!(second, Err(EngineError::ContextBusy)));
    drop(first);
    assert!(Sh4IrInterpreter::new(&vm, Sh4Bus::new(&vm), Arc::new(InterruptController::new())).is_ok());
}

#[test]
fn terminated_engine_ignores_requests() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    put(engine.bus_mut(), CODE, &[0x7001]);
    prepare(&mut engine, CODE);
    engine.term();
    assert_eq!(engine.state(), CpuState::Terminated);

    engine.start();
    assert!(!engine.is_cpu_running());
    engine.step().unwrap();
    engine.run().unwrap();
    assert_eq!(engine.context().pc, CODE);
    assert_eq!(engine.context().r[0], 0);
}

#[test]
fn trap_enters_the_vector() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    put(engine.bus_mut(), CODE, &[0xC320]);
    prepare(&mut engine, CODE);
    engine.step().unwrap();

    let ctx = engine.context();
    assert_eq!(ctx.pc, VBR + 0x100);
    assert_eq!(ctx.spc, CODE + 2);
    assert_eq!(ctx.ssr, 0x4000_0000);
    assert!(ctx.sr.bl() && ctx.sr.rb());
    let regs = engine.exception_regs();
    assert_eq!(regs.tra, 0x80);
    assert_eq!(regs.expevt, 0x160);
}

#[test]
fn exception_with_bl_set_is_fatal() {
    let vm = setup();
    let mut engine = ir_engine(&vm);
    put(engine.bus_mut(), CODE, &[0xFFFD]);
    prepare(&mut engine, CODE);
    engine.context_mut().set_sr_full(0x5000_0000);
    assert!(matches!(
        engine.step(),
        Err(EngineError::ExceptionWhileBlocked { expevt: 0x180, pc: CODE })
    ));
}

#[test]
fn interrupt_wakes_from_sleep() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    put(engine.bus_mut(), CODE, &[0x001B]);
    put(engine.bus_mut(), VBR + 0x600, &[0x0009]);
    prepare(&mut engine, CODE);

    engine.step().unwrap();
    assert!(engine.is_sleeping());
    engine.step().unwrap();
    assert!(engine.is_sleeping());
    assert_eq!(engine.context().pc, CODE + 2);

    // Masked at this level.
    engine.context_mut().sr.set_imask(9);
    engine.interrupts().raise(0x320, 9);
    engine.step().unwrap();
    assert!(engine.is_sleeping());

    engine.context_mut().sr.set_imask(0);
    engine.step().unwrap();
    assert!(!engine.is_sleeping());
    let ctx = engine.context();
    assert_eq!(ctx.spc, CODE + 2);
    assert_eq!(ctx.pc, VBR + 0x602);
    assert_eq!(engine.exception_regs().intevt, 0x320);
}

#[test]
fn state_round_trip() {
    let vm = setup();
    let mut engine = interpreter(&vm);
    prepare(&mut engine, CODE);
    {
        let ctx = engine.context_mut();
        for i in 0..16 {
            ctx.r[i] = 0x1000_0000 | i as u32;
            ctx.set_fr_bits(i, 0x3000_0000 | i as u32);
            ctx.set_xf_bits(i, 0x3100_0000 | i as u32);
        }
        for i in 0..8 {
            ctx.r_bank[i] = 0x1100_0000 | i as u32;
        }
        ctx.set_mac(0x0102_0304_0506_0708);
        ctx.set_sr_full(0x7000_83F3);
        ctx.set_fpscr(0x002C_0001);
        ctx.fpul = 0x2000_0001;
        ctx.gbr = 0x2000_0002;
        ctx.vbr = 0x2000_0003;
        ctx.ssr = 0x2000_0004;
        ctx.spc = 0x2000_0005;
        ctx.sgr = 0x2000_0006;
        ctx.dbr = 0x2000_0007;
        ctx.pr = 0x2000_0008;
        ctx.pc = 0x2000_000A;
    }
    assert!(engine.context().t());
    let before = *engine.context();
    let mut saved = Vec::new();
    engine.save_state(&mut saved).unwrap();

    *engine.context_mut() = bytemuck::Zeroable::zeroed();
    assert_ne!(bytemuck::bytes_of(engine.context()), bytemuck::bytes_of(&before));
    engine.load_state(&mut saved.as_slice()).unwrap();
    assert_eq!(bytemuck::bytes_of(engine.context()), bytemuck::bytes_of(&before));

    let mut foreign = saved.clone();
    foreign[0] = b'X';
    engine.context_mut().r[3] = 9;
    assert!(matches!(
        engine.load_state(&mut foreign.as_slice()),
        Err(EngineError::State(StateError::InvalidMagic(_)))
    ));
    assert_eq!(engine.context().r[3], 9);

    assert!(matches!(
        engine.load_state(&mut &saved[..saved.len() - 1]),
        Err(EngineError::State(_))
    ));
}

#[test]
fn blocks_are_cached_until_invalidated() {
    let vm = setup();
    let mut engine = ir_engine(&vm);
    put(engine.bus_mut(), CODE, &[0x7001, 0x000B, 0x0009]);
    prepare(&mut engine, CODE);

    let a = engine.build_block(CODE);
    let b = engine.build_block(CODE);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.len(), 3);

    engine.invalidate_block(CODE + 4);
    let c = engine.build_block(CODE);
    assert!(!Arc::ptr_eq(&a, &c));

    engine.reset_cache();
    assert!(engine.cache().is_empty());
    assert!(engine.last_executed_block().is_none());
    let d = engine.build_block(CODE);
    assert!(!Arc::ptr_eq(&c, &d));
}

#[test]
fn ir_step_runs_a_whole_block() {
    let vm = setup();
    let mut engine = ir_engine(&vm);
    // add #1,r0 ; add #1,r0 ; rts ; add #1,r0
    put(engine.bus_mut(), CODE, &[0x7001, 0x7001, 0x000B, 0x7001]);
    prepare(&mut engine, CODE);
    engine.context_mut().pr = 0x8C02_0000;

    engine.step().unwrap();
    assert_eq!(engine.context().r[0], 3);
    assert_eq!(engine.context().pc, 0x8C02_0000);
    let block = engine.last_executed_block().expect("block");
    assert_eq!(block.start_pc, CODE);
    assert_eq!(block.len(), 4);
}

#[cfg(target_os = "linux")]
mod guarded {
    use super::*;
    use sh4_core::smc::FAULT_LOG_CAPACITY;

    // mov #n,r0 ; bra CODE ; nop
    fn self_loop(n: u8) -> [u16; 3] {
        [0xE000 | n as u16, 0xAFFD, 0x0009]
    }

    #[test]
    fn store_to_code_invalidates_its_block() {
        let vm = setup();
        let mut engine = ir_engine(&vm);
        put(engine.bus_mut(), CODE, &self_loop(1));
        prepare(&mut engine, CODE);

        engine.step().unwrap();
        assert_eq!(engine.context().r[0], 1);
        assert_eq!(engine.context().pc, CODE);
        let block = engine.cache().lookup(CODE).expect("cached");
        assert!(block.guarded);
        let before = engine.cache().stats();

        // Faults, gets logged and then goes through.
        engine.bus_mut().write16(CODE, 0xE002);
        assert_eq!(engine.bus_mut().read16(CODE), 0xE002);

        engine.step().unwrap();
        assert_eq!(engine.context().r[0], 2);
        let after = engine.cache().stats();
        assert_eq!(after.invalidations - before.invalidations, 1);
        assert_eq!(after.builds - before.builds, 1);
        assert!(engine.cache().lookup(CODE).expect("rebuilt").guarded);
    }

    #[test]
    fn store_into_the_running_block_stops_it() {
        let vm = setup();
        let mut engine = ir_engine(&vm);
        // mov.w r2,@r1 ; mov #1,r0 ; sleep
        put(engine.bus_mut(), CODE, &[0x2121, 0xE001, 0x001B]);
        prepare(&mut engine, CODE);
        engine.context_mut().r[1] = CODE + 2;
        engine.context_mut().r[2] = 0xE005;
        let before = engine.cache().stats();

        // The store rewrites the next instruction, so the block ends there.
        engine.step().unwrap();
        assert_eq!(engine.context().pc, CODE + 2);
        assert_ne!(engine.context().r[0], 1);
        assert!(!engine.is_sleeping());

        engine.step().unwrap();
        assert_eq!(engine.context().r[0], 5);
        assert!(engine.is_sleeping());
        let after = engine.cache().stats();
        assert_eq!(after.invalidations - before.invalidations, 1);
        assert_eq!(after.builds - before.builds, 2);
    }

    #[test]
    fn fault_log_overflow_resets_the_cache() {
        let vm = setup();
        let mut engine = ir_engine(&vm);
        put(engine.bus_mut(), CODE, &self_loop(1));
        prepare(&mut engine, CODE);
        engine.step().unwrap();

        let guard = engine.cache().guard().cloned().expect("guard");
        for i in 0..=FAULT_LOG_CAPACITY as u32 {
            guard.log().push(i * 0x1000);
        }
        let resets = engine.cache().stats().resets;
        engine.step().unwrap();
        assert_eq!(engine.cache().stats().resets, resets + 1);
        assert!(guard.log().is_empty());
        assert_eq!(engine.cache().len(), 1);
    }

    #[test]
    fn dropping_the_engine_unlocks_code() {
        let vm = setup();
        {
            let mut engine = ir_engine(&vm);
            put(engine.bus_mut(), CODE, &self_loop(1));
            prepare(&mut engine, CODE);
            engine.step().unwrap();
        }
        let mut bus = Sh4Bus::new(&vm);
        bus.write16(CODE, 0xE003);
        assert_eq!(bus.read16(CODE), 0xE003);
    }
}
