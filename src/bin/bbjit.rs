//! bbjit driver.
//!
//! Compiles the entry points of bytecode listings (see `bbjit::test_iseq`) over simulated
//! executable memory, optionally services pending branch stubs the way running code would,
//! and reports disassembly, statistics or an ELF dump of the result.

use bbjit::bbv::{BlockStatus, BranchRef};
use bbjit::core::options::{JitOptions, TargetArch};
use bbjit::dump;
use bbjit::host::{ExecutionContext, Iseq, Value};
use bbjit::jit::Jit;
use bbjit::test_iseq::{parse_units, TestFrame};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Arch {
    #[value(name = "x86-64")]
    X86_64,
    Arm64,
}

impl From<Arch> for TargetArch {
    fn from(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => TargetArch::X86_64,
            Arch::Arm64 => TargetArch::Arm64,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "bbjit")]
#[command(about = "Lazy basic block versioning JIT driver")]
#[command(version)]
struct Cli {
    /// Bytecode listings to compile
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Target instruction set
    #[arg(long, value_enum, default_value = "x86-64")]
    arch: Arch,

    /// Executable memory in MiB
    #[arg(long, default_value_t = 16)]
    exec_mem_size: usize,

    /// Maximum versions per block
    #[arg(long)]
    max_versions: Option<usize>,

    /// Rounds of branch stub servicing after the entry points are compiled
    #[arg(long, default_value_t = 0)]
    hit_stubs: usize,

    /// Run a global invalidation at the end
    #[arg(long)]
    invalidate: bool,

    /// Print disassembly of every live block
    #[arg(long)]
    disasm: bool,

    /// Print compilation statistics
    #[arg(long)]
    stats: bool,

    /// Write generated code to an ELF object
    #[arg(long, value_name = "OUT")]
    elf: Option<PathBuf>,

    /// Extra JIT options (name=value)
    #[arg(short = 'X', value_name = "OPT")]
    options: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut options = JitOptions::from_args(&cli.options)?;
    options.parse_option(&format!("exec-mem-size={}", cli.exec_mem_size))?;
    if let Some(n) = cli.max_versions {
        options.parse_option(&format!("max-versions={n}"))?;
    }
    options.dump_disasm |= cli.disasm;
    options.gen_stats |= cli.stats;

    let jit = Jit::simulated(cli.arch.into(), options)?;

    let mut units: Vec<Arc<dyn Iseq>> = Vec::new();
    for file in &cli.files {
        let src = fs::read_to_string(file)?;
        let parsed = parse_units(&src).map_err(|err| format!("{}: {err}", file.display()))?;
        units.extend(parsed.into_iter().map(|iseq| Arc::new(iseq) as Arc<dyn Iseq>));
    }

    for iseq in &units {
        let frame = TestFrame::new(iseq.clone());
        match jit.gen_entry_point(iseq, 0, Some(&frame as &dyn ExecutionContext)) {
            Some(entry) => println!("{} (unit {}): entry at {entry:?}", iseq.name(), iseq.id()),
            None => println!("{} (unit {}): interpreted", iseq.name(), iseq.id()),
        }
    }

    for round in 0..cli.hit_stubs {
        let serviced = service_pending_stubs(&jit, &units);
        log::info!("stub round {round}: serviced {serviced} stubs");
        if serviced == 0 {
            break;
        }
    }

    if cli.invalidate {
        jit.invalidate_all()?;
    }

    let core = jit.lock();

    if cli.disasm {
        for block in core.graph().live_blocks() {
            println!("{}", dump::disasm_block(&core, block));
        }
    }

    if cli.stats {
        println!("{}", core.stats());
    }

    if let Some(out) = &cli.elf {
        let bytes = dump::write_object(&core)?;
        fs::write(out, &bytes)?;
        println!("wrote {} bytes to {}", bytes.len(), out.display());
    }

    Ok(())
}

/// Stack slots below the stack pointer of synthetic frames, so stub hits may move it down.
const STUB_FRAME_DEPTH: usize = 8;

/// Take every pending branch target of a live block once, as generated code would.
fn service_pending_stubs(jit: &Jit, units: &[Arc<dyn Iseq>]) -> usize {
    let pending: Vec<(u64, u32, u32)> = {
        let core = jit.lock();
        let graph = core.graph();
        (0..graph.num_branches())
            .map(|i| BranchRef::from_raw(i as u64))
            .filter(|&br| graph.block(graph.branch(br).block).status == BlockStatus::Live)
            .flat_map(|br| {
                let branch = graph.branch(br);
                (0..branch.kind.num_targets())
                    .filter(|&idx| branch.blocks[idx].is_none())
                    .filter_map(|idx| Some((br.as_raw(), idx as u32, branch.targets[idx]?.iseq.0)))
                    .collect::<Vec<_>>()
            })
            .collect()
    };

    for &(branch, target_idx, iseq_id) in &pending {
        let Some(iseq) = units.iter().find(|iseq| iseq.id().0 == iseq_id) else {
            continue;
        };
        let mut frame = TestFrame::new(iseq.clone());
        for _ in 0..STUB_FRAME_DEPTH {
            frame.push(Value::NIL);
        }
        let dst = jit.branch_stub_hit(branch, target_idx, &mut frame);
        log::debug!(
            "branch {branch}[{target_idx}] -> {dst:?}, resuming at pc {:#x}",
            frame.current_pc()
        );
    }

    pending.len()
}
