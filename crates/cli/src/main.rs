//! Trace-driven simulator CLI.
//!
//! This binary is the single entry point for simulation runs. It performs:
//! 1. **Configuration:** Loads a JSON config file or falls back to the
//!    built-in defaults.
//! 2. **Phases:** Runs the warmup phase, then the region of interest, then
//!    lets outstanding requests drain.
//! 3. **Reporting:** Prints per-phase statistics and exits nonzero on a
//!    deadlock.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tracesim_core::{SimConfig, SimError, Simulator};

/// Exit code used when the simulated system deadlocks.
const DEADLOCK_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "tracesim",
    author,
    version,
    about = "Cycle-driven, trace-driven CPU and memory hierarchy simulator",
    long_about = "Simulates an out-of-order core per trace file together with its cache \
hierarchy, TLBs, page-table walker, and DRAM.\n\nExamples:\n  \
tracesim --warmup-instructions 1000000 --simulation-instructions 10000000 trace.xz\n  \
tracesim -c config.json trace0.gz trace1.gz"
)]
struct Cli {
    /// Trace files, one per simulated core. Compressed (.gz/.xz/.bz2) and
    /// http(s) traces are supported.
    #[arg(required = true)]
    traces: Vec<String>,

    /// Instructions per core spent warming caches and predictors.
    #[arg(short, long, default_value_t = 1_000_000)]
    warmup_instructions: u64,

    /// Instructions per core in the measured region of interest.
    #[arg(short, long, default_value_t = 10_000_000)]
    simulation_instructions: u64,

    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

fn load_config(path: Option<&str>) -> SimConfig {
    let Some(path) = path else {
        return SimConfig::default();
    };
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading config {path}: {e}");
        process::exit(1);
    });
    serde_json::from_str(&text).unwrap_or_else(|e| {
        eprintln!("Error parsing config {path}: {e}");
        process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    let mut sim = Simulator::new(config, &cli.traces).unwrap_or_else(|e| {
        eprintln!("Error opening traces: {e}");
        process::exit(1);
    });

    println!(
        "Warmup: {} instructions  Simulation: {} instructions  Cores: {}",
        cli.warmup_instructions,
        cli.simulation_instructions,
        cli.traces.len()
    );

    if let Err(err) = run(&mut sim, cli.warmup_instructions, cli.simulation_instructions) {
        eprintln!("\nFATAL: {err}");
        if matches!(err, SimError::Deadlock { .. }) {
            process::exit(DEADLOCK_EXIT_CODE);
        }
        process::exit(1);
    }

    println!("\nRegion of interest statistics");
    sim.print_stats();
    sim.final_stats();
}

fn run(sim: &mut Simulator, warmup: u64, simulation: u64) -> Result<(), SimError> {
    let warmup_result = sim.run_phase(true, warmup)?;
    println!(
        "Warmup finished: {:?} instructions",
        warmup_result.instructions
    );

    let roi = sim.run_phase(false, simulation)?;
    for (cpu, (instrs, cycles)) in roi.instructions.iter().zip(&roi.cycles).enumerate() {
        let ipc = if *cycles == 0 {
            0.0
        } else {
            *instrs as f64 / *cycles as f64
        };
        println!("cpu{cpu}: {instrs} instructions in {cycles} cycles (IPC {ipc:.4})");
    }

    sim.drain(100_000)
}
