//! A bare SH4 machine: the guest address space, a bus over it and one CPU
//! engine. Enough to load a program into system RAM and run it.

use std::str::FromStr;
use std::sync::Arc;

use sh4_core::{
    EngineError, InterruptController, MemoryBus, Sh4Bus, Sh4Context, Sh4Engine, Sh4Interpreter,
    Sh4IrInterpreter, engine_vmem_config,
};
use thiserror::Error;
use vmem::{VirtualMemory, VmemConfig, VmemError};

pub use sh4_core;
pub use vmem;

/// Where homebrew binaries conventionally start.
pub const DEFAULT_ENTRY: u32 = 0x8C01_0000;

const BOOT_STACK: u32 = 0x8D00_0000;
const BOOT_VBR: u32 = 0x8C00_0000;
const BOOT_SR: u32 = 0x4000_00F0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    Interpreter,
    #[default]
    Ir,
}

impl FromStr for EngineKind {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interp" | "interpreter" => Ok(EngineKind::Interpreter),
            "ir" | "block" => Ok(EngineKind::Ir),
            other => Err(MachineError::UnknownEngine(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub vmem: VmemConfig,
    pub engine: EngineKind,
    pub entry: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vmem: VmemConfig::dreamcast(),
            engine: EngineKind::default(),
            entry: DEFAULT_ENTRY,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Vmem(#[from] VmemError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{len:#x} bytes at {addr:#010x} do not fit in system ram")]
    OutOfRam { addr: u32, len: usize },

    #[error("unknown engine {0:?}, expected interp or ir")]
    UnknownEngine(String),
}

/// Reserves and maps the guest address space for `config`.
pub fn create_vmem(config: &MachineConfig) -> Result<VirtualMemory, MachineError> {
    let mut vm = VirtualMemory::init(engine_vmem_config(config.vmem.clone()))?;
    vm.create_default_mappings();
    Ok(vm)
}

pub struct Machine<'vm> {
    vm: &'vm VirtualMemory,
    /// Host-side access for loading; goes through the same views as the CPU.
    loader: Sh4Bus<'vm>,
    engine: Box<dyn Sh4Engine + 'vm>,
    entry: u32,
}

impl<'vm> Machine<'vm> {
    pub fn new(vm: &'vm VirtualMemory, config: &MachineConfig) -> Result<Self, MachineError> {
        let interrupts = Arc::new(InterruptController::new());
        let engine: Box<dyn Sh4Engine + 'vm> = match config.engine {
            EngineKind::Interpreter => {
                Box::new(Sh4Interpreter::new(vm, Sh4Bus::new(vm), interrupts)?)
            }
            EngineKind::Ir => Box::new(Sh4IrInterpreter::new(vm, Sh4Bus::new(vm), interrupts)?),
        };
        log::info!("machine: {:?} engine, entry {:#010x}", config.engine, config.entry);

        let mut machine = Self {
            vm,
            loader: Sh4Bus::new(vm),
            engine,
            entry: config.entry,
        };
        machine.reset()?;
        Ok(machine)
    }

    /// Hard reset, then the register state a program sees when the boot
    /// ROM hands over to it.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.engine.init()?;
        let ctx = self.engine.context_mut();
        ctx.r[15] = BOOT_STACK;
        ctx.sgr = BOOT_STACK;
        ctx.gbr = BOOT_VBR;
        ctx.vbr = BOOT_VBR;
        ctx.set_sr_full(BOOT_SR | 1);
        ctx.pc = self.entry;
        Ok(())
    }

    /// Copies `bytes` into system RAM at `addr` (any mirror or segment).
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MachineError> {
        let ram_size = self.vm.backing_layout().ram.size;
        let in_area3 = addr & 0x1C00_0000 == 0x0C00_0000;
        let start = (addr as usize) & (ram_size - 1);
        if !in_area3 || start + bytes.len() > ram_size {
            return Err(MachineError::OutOfRam { addr, len: bytes.len() });
        }

        for (i, &b) in bytes.iter().enumerate() {
            self.loader.write8(addr + i as u32, b);
        }
        // Unguarded blocks would catch this too, one reset is cheaper.
        self.engine.reset_cache();
        log::info!("machine: loaded {:#x} bytes at {addr:#010x}", bytes.len());
        Ok(())
    }

    /// Runs at most `steps` engine steps. Returns how many ran.
    pub fn run_steps(&mut self, steps: u64) -> Result<u64, MachineError> {
        for done in 0..steps {
            if self.engine.is_sleeping() && !self.engine.interrupts().is_pending() {
                log::info!("machine: cpu asleep with nothing pending after {done} steps");
                return Ok(done);
            }
            self.engine.step()?;
        }
        Ok(steps)
    }

    pub fn context(&self) -> &Sh4Context {
        self.engine.context()
    }

    pub fn engine(&self) -> &dyn Sh4Engine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut (dyn Sh4Engine + 'vm) {
        self.engine.as_mut()
    }

    pub fn vm(&self) -> &'vm VirtualMemory {
        self.vm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Vec<u8> {
        // mov #5,r1 ; add #3,r1 ; sleep
        [0xE105u16, 0x7103, 0x001B]
            .iter()
            .flat_map(|op| op.to_le_bytes())
            .collect()
    }

    #[test]
    fn engine_names() {
        assert_eq!("ir".parse::<EngineKind>().unwrap(), EngineKind::Ir);
        assert_eq!("interp".parse::<EngineKind>().unwrap(), EngineKind::Interpreter);
        assert!(matches!("jit".parse::<EngineKind>(), Err(MachineError::UnknownEngine(_))));
    }

    #[test]
    fn runs_a_loaded_program() {
        let _ = env_logger::builder().is_test(true).try_init();
        for engine in [EngineKind::Interpreter, EngineKind::Ir] {
            let config = MachineConfig {
                engine,
                ..MachineConfig::default()
            };
            let vm = create_vmem(&config).unwrap();
            let mut machine = Machine::new(&vm, &config).unwrap();
            assert_eq!(machine.context().r[15], BOOT_STACK);
            assert!(machine.context().t());

            machine.load(DEFAULT_ENTRY, &program()).unwrap();
            let ran = machine.run_steps(100).unwrap();
            assert!(ran < 100, "{engine:?} never went to sleep");
            assert_eq!(machine.context().r[1], 8);
            assert!(machine.engine().is_sleeping());
        }
    }

    #[test]
    fn load_outside_ram_is_rejected() {
        let config = MachineConfig::default();
        let vm = create_vmem(&config).unwrap();
        let mut machine = Machine::new(&vm, &config).unwrap();
        assert!(matches!(
            machine.load(0x8400_0000, &[0; 4]),
            Err(MachineError::OutOfRam { .. })
        ));
        assert!(matches!(
            machine.load(0x8CFF_FFFE, &[0; 4]),
            Err(MachineError::OutOfRam { .. })
        ));
        machine.load(0xAC00_0000, &[1, 2]).unwrap();
    }
}
