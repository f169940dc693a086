//! Table-driven instruction checks. Each vector sets up registers and
//! memory, runs a few units and compares the result.

mod common;

use common::{FlatMemory, get_reg, hex, init_logging, load_vectors, read_sized, set_reg, write_sized};
use sh4_core::context::Sh4Context;
use sh4_core::executor::execute_unit;
use sh4_core::sh4mem::read_mem;
use sh4_core::{Sh4Exception, decode};

const DEFAULT_PC: u32 = 0x8C01_0000;
const DEFAULT_SR: u32 = 0x4000_0000;
const DEFAULT_FPSCR: u32 = 0x0004_0001;

fn run_vector(v: &common::Vector) -> Result<(), String> {
    let mut ctx = Sh4Context::new();
    let mut mem = FlatMemory::new();

    // SR and FPSCR first: they switch banks.
    let sr = v.initial.get("sr").map_or(DEFAULT_SR, |s| hex(s));
    let fpscr = v.initial.get("fpscr").map_or(DEFAULT_FPSCR, |s| hex(s));
    ctx.set_sr_full(sr);
    ctx.set_fpscr(fpscr);
    for (name, value) in &v.initial {
        if name != "sr" && name != "fpscr" {
            set_reg(&mut ctx, name, hex(value));
        }
    }

    ctx.pc = v.pc.as_deref().map_or(DEFAULT_PC, hex);
    let code: Vec<u16> = v.code.iter().map(|c| hex(c) as u16).collect();
    mem.put_code(ctx.pc, &code);
    for m in &v.memory {
        write_sized(&mut mem, m);
    }

    let mut last_error: Option<Sh4Exception> = None;
    for step in 0..v.steps {
        let pc = ctx.pc;
        let instr = decode(pc, read_mem::<u16, _>(&mut mem, pc));
        match execute_unit(&mut ctx, &mut mem, &instr, None) {
            Ok(_) => last_error = None,
            Err(raised) => {
                if step + 1 != v.steps {
                    return Err(format!("step {step} raised {:?}", raised.exception));
                }
                last_error = Some(raised.exception);
            }
        }
    }

    match (&v.exception, last_error) {
        (Some(want), Some(got)) => {
            let got = format!("{got:?}");
            if !got.starts_with(want.as_str()) {
                return Err(format!("expected {want}, raised {got}"));
            }
        }
        (Some(want), None) => return Err(format!("expected {want}, nothing raised")),
        (None, Some(got)) => return Err(format!("unexpected {got:?}")),
        (None, None) => {}
    }

    let mut errors = Vec::new();
    for (name, want) in &v.expect {
        let (want, got) = (hex(want), get_reg(&ctx, name));
        if want != got {
            errors.push(format!("{name}: expected {want:#010x}, got {got:#010x}"));
        }
    }
    for m in &v.expect_memory {
        let (want, got) = (hex(&m.value), read_sized(&mut mem, m));
        if want != got {
            errors.push(format!("[{}]: expected {want:#x}, got {got:#x}", m.addr));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors.join(", ")) }
}

#[test]
fn instruction_vectors() {
    init_logging();
    let vectors = load_vectors(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/sh4_vectors.json"));
    assert!(!vectors.is_empty());

    let failures: Vec<String> = vectors
        .iter()
        .filter_map(|v| run_vector(v).err().map(|e| format!("{}: {e}", v.name)))
        .collect();
    assert!(failures.is_empty(), "{} of {} vectors failed:\n{}", failures.len(), vectors.len(), failures.join("\n"));
}
