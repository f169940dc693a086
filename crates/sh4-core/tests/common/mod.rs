// Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use sh4_core::context::Sh4Context;
use sh4_core::sh4mem::MemoryBus;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 16MB of RAM answering at every mirror of area 3. Other areas read as
/// zero and drop writes.
pub struct FlatMemory {
    ram: Vec<u8>,
}

impl FlatMemory {
    pub const RAM_SIZE: usize = 0x0100_0000;

    pub fn new() -> Self {
        Self {
            ram: vec![0; Self::RAM_SIZE],
        }
    }

    fn offset(addr: u32, size: usize) -> Option<usize> {
        if addr & 0x1C00_0000 != 0x0C00_0000 {
            return None;
        }
        let offset = (addr as usize) & (Self::RAM_SIZE - 1);
        (offset + size <= Self::RAM_SIZE).then_some(offset)
    }

    fn load<const N: usize>(&self, addr: u32) -> [u8; N] {
        match Self::offset(addr, N) {
            Some(o) => self.ram[o..o + N].try_into().unwrap(),
            None => [0; N],
        }
    }

    fn store<const N: usize>(&mut self, addr: u32, bytes: [u8; N]) {
        if let Some(o) = Self::offset(addr, N) {
            self.ram[o..o + N].copy_from_slice(&bytes);
        }
    }

    pub fn put_code(&mut self, pc: u32, code: &[u16]) {
        for (i, &op) in code.iter().enumerate() {
            self.write16(pc + 2 * i as u32, op);
        }
    }
}

impl MemoryBus for FlatMemory {
    fn read8(&mut self, addr: u32) -> u8 {
        self.load::<1>(addr)[0]
    }
    fn read16(&mut self, addr: u32) -> u16 {
        u16::from_le_bytes(self.load(addr))
    }
    fn read32(&mut self, addr: u32) -> u32 {
        u32::from_le_bytes(self.load(addr))
    }
    fn read64(&mut self, addr: u32) -> u64 {
        u64::from_le_bytes(self.load(addr))
    }
    fn write8(&mut self, addr: u32, value: u8) {
        self.store(addr, [value]);
    }
    fn write16(&mut self, addr: u32, value: u16) {
        self.store(addr, value.to_le_bytes());
    }
    fn write32(&mut self, addr: u32, value: u32) {
        self.store(addr, value.to_le_bytes());
    }
    fn write64(&mut self, addr: u32, value: u64) {
        self.store(addr, value.to_le_bytes());
    }
    fn mem_ptr(&mut self, _addr: u32, _size: u32) -> Option<*mut u8> {
        None
    }
}

// ---------------------------------------------------------------------------
// JSON vectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MemInit {
    pub addr: String,
    pub value: String,
    #[serde(default = "default_size")]
    pub size: u32,
}

fn default_size() -> u32 {
    32
}

fn default_steps() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vector {
    pub name: String,
    #[serde(default)]
    pub pc: Option<String>,
    pub code: Vec<String>,
    #[serde(default)]
    pub memory: Vec<MemInit>,
    #[serde(default)]
    pub initial: BTreeMap<String, String>,
    #[serde(default)]
    pub expect: BTreeMap<String, String>,
    #[serde(default)]
    pub expect_memory: Vec<MemInit>,
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Debug name of the exception the last step raises.
    #[serde(default)]
    pub exception: Option<String>,
}

pub fn hex(s: &str) -> u32 {
    let digits = s.trim_start_matches("0x").replace('_', "");
    u32::from_str_radix(&digits, 16).unwrap_or_else(|_| panic!("bad hex value {s:?}"))
}

pub fn load_vectors(path: impl AsRef<Path>) -> Vec<Vector> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
    serde_json::from_str(&text).unwrap_or_else(|err| panic!("parsing {}: {err}", path.display()))
}

fn indexed(name: &str, prefix: &str) -> Option<usize> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Writes a register by its assembler name.
pub fn set_reg(ctx: &mut Sh4Context, name: &str, value: u32) {
    if let Some(n) = indexed(name, "rb") {
        ctx.r_bank[n] = value;
    } else if let Some(n) = indexed(name, "r") {
        ctx.r[n] = value;
    } else if let Some(n) = indexed(name, "fr") {
        ctx.set_fr_bits(n, value);
    } else if let Some(n) = indexed(name, "xf") {
        ctx.set_xf_bits(n, value);
    } else {
        match name {
            "pc" => ctx.pc = value,
            "pr" => ctx.pr = value,
            "sr" => ctx.set_sr_full(value),
            "t" => ctx.set_t(value != 0),
            "gbr" => ctx.gbr = value,
            "vbr" => ctx.vbr = value,
            "ssr" => ctx.ssr = value,
            "spc" => ctx.spc = value,
            "sgr" => ctx.sgr = value,
            "dbr" => ctx.dbr = value,
            "mach" => ctx.set_mach(value),
            "macl" => ctx.set_macl(value),
            "fpul" => ctx.fpul = value,
            "fpscr" => ctx.set_fpscr(value),
            other => panic!("unknown register {other}"),
        }
    }
}

pub fn get_reg(ctx: &Sh4Context, name: &str) -> u32 {
    if let Some(n) = indexed(name, "rb") {
        ctx.r_bank[n]
    } else if let Some(n) = indexed(name, "r") {
        ctx.r[n]
    } else if let Some(n) = indexed(name, "fr") {
        ctx.fr_bits(n)
    } else if let Some(n) = indexed(name, "xf") {
        ctx.xf_bits(n)
    } else {
        match name {
            "pc" => ctx.pc,
            "pr" => ctx.pr,
            "sr" => ctx.sr_full(),
            "t" => ctx.t() as u32,
            "gbr" => ctx.gbr,
            "vbr" => ctx.vbr,
            "ssr" => ctx.ssr,
            "spc" => ctx.spc,
            "sgr" => ctx.sgr,
            "dbr" => ctx.dbr,
            "mach" => ctx.mach(),
            "macl" => ctx.macl(),
            "fpul" => ctx.fpul,
            "fpscr" => ctx.fpscr.full(),
            other => panic!("unknown register {other}"),
        }
    }
}

pub fn write_sized<B: MemoryBus>(bus: &mut B, m: &MemInit) {
    let (addr, value) = (hex(&m.addr), hex(&m.value));
    match m.size {
        8 => bus.write8(addr, value as u8),
        16 => bus.write16(addr, value as u16),
        32 => bus.write32(addr, value),
        other => panic!("bad size {other}"),
    }
}

pub fn read_sized<B: MemoryBus>(bus: &mut B, m: &MemInit) -> u32 {
    let addr = hex(&m.addr);
    match m.size {
        8 => bus.read8(addr) as u32,
        16 => bus.read16(addr) as u32,
        32 => bus.read32(addr),
        other => panic!("bad size {other}"),
    }
}
