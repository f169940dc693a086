//! SH4 CPU core: register context, decoder, block cache and the two engines
//! built on top of them.

pub mod backend_ipr;
pub mod block_cache;
pub mod context;
pub mod engine;
pub mod exceptions;
pub mod executor;
pub mod interpreter;
pub mod ir;
pub mod ir_interpreter;
pub mod sh4dec;
pub mod sh4mem;
pub mod smc;
pub mod state;

pub use block_cache::{BlockCache, CacheStats, LookupTable};
pub use context::Sh4Context;
pub use engine::{CpuState, EngineError, RunControl, Sh4Engine};
pub use exceptions::{ExceptionRegs, InterruptController, Sh4Exception};
pub use interpreter::Sh4Interpreter;
pub use ir::{Block, Instr, Op, Operand};
pub use ir_interpreter::Sh4IrInterpreter;
pub use sh4dec::{decode, format_disas};
pub use sh4mem::{BusError, MemoryBus, MmioHandler, Sh4Bus};
pub use state::{StateError, deserialize, serialize};

/// Adds the context area and block lookup table the engines expect in front
/// of guest memory.
pub fn engine_vmem_config(config: vmem::VmemConfig) -> vmem::VmemConfig {
    config.with_context(vmem::RESERVATION_ALIGN, LookupTable::SIZE)
}
