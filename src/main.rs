use std::fs;
use std::process::ExitCode;

use nulldc_core::{DEFAULT_ENTRY, EngineKind, Machine, MachineConfig, create_vmem};
use sh4_core::format_disas;
use sh4_core::sh4mem::{MemoryBus, Sh4Bus};

const USAGE: &str = "usage: sh4run [--engine interp|ir] [--load FILE] [--entry ADDR] \
                     [--steps N] [--naomi] [--4gb] [--trace]";

struct Args {
    config: MachineConfig,
    load: Option<String>,
    steps: u64,
    trace: bool,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("bad number {s:?}: {e}"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: MachineConfig::default(),
        load: None,
        steps: 1_000_000,
        trace: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().ok_or_else(|| format!("{arg} needs a value"));
        match arg.as_str() {
            "--engine" => args.config.engine = value()?.parse::<EngineKind>().map_err(|e| e.to_string())?,
            "--load" => args.load = Some(value()?),
            "--entry" => args.config.entry = parse_u32(&value()?)?,
            "--steps" => args.steps = parse_u32(&value()?)? as u64,
            "--naomi" => {
                let prefer_4gb = args.config.vmem.prefer_4gb;
                args.config.vmem = vmem::VmemConfig::naomi();
                args.config.vmem.prefer_4gb = prefer_4gb;
            }
            "--4gb" => args.config.vmem.prefer_4gb = true,
            "--trace" => args.trace = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument {other}\n{USAGE}")),
        }
    }
    Ok(args)
}

fn dump_registers(machine: &Machine<'_>) {
    let ctx = machine.context();
    for row in 0..4 {
        let regs: Vec<String> = (0..4)
            .map(|col| {
                let n = row * 4 + col;
                format!("r{n:<2} {:08x}", ctx.r[n])
            })
            .collect();
        println!("{}", regs.join("  "));
    }
    println!(
        "pc  {:08x}  pr  {:08x}  sr  {:08x}  gbr {:08x}",
        ctx.pc,
        ctx.pr,
        ctx.sr_full(),
        ctx.gbr
    );
    println!(
        "mach {:08x} macl {:08x} fpscr {:08x} fpul {:08x}",
        ctx.mach(),
        ctx.macl(),
        ctx.fpscr.full(),
        ctx.fpul
    );
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let vm = create_vmem(&args.config)?;
    let mut machine = Machine::new(&vm, &args.config)?;

    if let Some(path) = &args.load {
        let image = fs::read(path).map_err(|e| format!("reading {path}: {e}"))?;
        machine.load(args.config.entry, &image)?;
    } else if args.config.entry == DEFAULT_ENTRY {
        log::warn!("sh4run: nothing loaded, running whatever is in ram");
    }

    if args.trace {
        let mut bus = Sh4Bus::new(&vm);
        let pc = machine.context().pc;
        log::info!("sh4run: first instruction {}", format_disas(pc, bus.read16(pc)));
    }

    let ran = machine.run_steps(args.steps)?;
    println!("{ran} steps");
    dump_registers(&machine);
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let default_level = if args.trace { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("sh4run: {err}");
            ExitCode::FAILURE
        }
    }
}
