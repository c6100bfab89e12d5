//! Tessera CLI - list devices and run elementwise instruction chains.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tessera_core::config::ALL_DEVICES;
use tessera_core::{BinaryOp, Matrix, PoolConfig, RunConfiguration, RuntimeMetrics, Shape};
use tessera_runtime::{
    DeviceContextPool, ExecutionContext, Instruction, InstructionProgram, ProgramExecutor,
};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Run elementwise matrix programs on GPU devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices a pool would be built from
    Devices {
        /// Use N simulated host devices instead of enumerating GPUs
        #[arg(long, value_name = "N")]
        simulated: Option<usize>,
    },
    /// Run a chain of instructions over a random input matrix
    Run {
        /// Opcode to apply, in order (can be repeated). Binary opcodes
        /// combine the running value with the input.
        #[arg(long = "op", default_value = "exp")]
        ops: Vec<String>,

        /// Input rows
        #[arg(long, default_value = "3")]
        rows: usize,

        /// Input columns
        #[arg(long, default_value = "4")]
        cols: usize,

        /// Run the program on the host without checking out a device
        #[arg(long)]
        no_accelerator: bool,

        /// Maximum concurrently checked-out device contexts (-1 = all devices)
        #[arg(long, default_value_t = ALL_DEVICES, allow_negative_numbers = true)]
        max_devices: i32,

        /// Compile specialized kernels through the generated code cache
        #[arg(long)]
        codegen: bool,

        /// Report transfer and allocation counters
        #[arg(long)]
        extra_device_stats: bool,

        /// Report per-opcode kernel timings
        #[arg(long)]
        extra_kernel_stats: bool,

        /// Use N simulated host devices instead of enumerating GPUs
        #[arg(long, value_name = "N")]
        simulated: Option<usize>,

        /// Random seed for the input matrix
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Devices { simulated } => {
            cmd_devices(simulated)?;
        }
        Commands::Run {
            ops,
            rows,
            cols,
            no_accelerator,
            max_devices,
            codegen,
            extra_device_stats,
            extra_kernel_stats,
            simulated,
            seed,
        } => {
            let config = RunConfiguration::default()
                .with_accelerator(!no_accelerator)
                .with_max_device_contexts(max_devices)
                .with_codegen(codegen)
                .with_extra_device_stats(extra_device_stats)
                .with_extra_kernel_stats(extra_kernel_stats);
            cmd_run(&ops, Shape::new(rows, cols), config, simulated, seed)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn build_pool(simulated: Option<usize>) -> Result<DeviceContextPool> {
    let config = PoolConfig::default();
    let pool = match simulated {
        Some(count) => DeviceContextPool::simulated(count, config)
            .context("Failed to create simulated device pool")?,
        None => DeviceContextPool::discover(config).context("Failed to enumerate GPU devices")?,
    };
    Ok(pool)
}

/// List the devices behind a pool.
fn cmd_devices(simulated: Option<usize>) -> Result<()> {
    let pool = build_pool(simulated)?;
    let devices = pool.devices();
    if devices.is_empty() {
        println!("No devices found. Use --simulated N to run on host devices.");
        return Ok(());
    }

    println!("Devices ({}):", devices.len());
    for device in devices {
        println!("  [{}] {}", device.ordinal(), device.name());
    }
    Ok(())
}

/// Run an instruction chain and print the result and run report.
fn cmd_run(
    ops: &[String],
    shape: Shape,
    config: RunConfiguration,
    simulated: Option<usize>,
    seed: Option<u64>,
) -> Result<()> {
    let program = build_chain(ops)?;
    tracing::debug!(?config, instructions = program.len(), "Starting run");
    let metrics = Arc::new(RuntimeMetrics::new());
    let pool = build_pool(simulated)?;
    if config.accelerator_enabled && pool.device_count() == 0 {
        bail!("No devices available; use --simulated N or --no-accelerator");
    }
    let executor = ProgramExecutor::new(Arc::new(pool), Arc::clone(&metrics));

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_seed(rand::random()),
    };
    let input = Matrix::from_fn(shape, |_, _| rng.random_range(-1.0f32..1.0));

    let mut ec = ExecutionContext::new(Arc::clone(&metrics));
    ec.bind_matrix("X", input)?;

    println!("Program:");
    for instruction in program.instructions() {
        println!("  {instruction}");
    }

    executor
        .run(&program, Some(&mut ec), &config)
        .context("Program run failed")?;

    let output = ec.matrix("Y").context("Program produced no output")?;
    println!("\nOutput {}:", output.shape());
    print_matrix(&output);

    if let Some(report) = metrics.last_report() {
        println!("\n{report}");
    }
    Ok(())
}

/// Build `X -> T1 -> ... -> Y`, freeing each intermediate once consumed.
fn build_chain(ops: &[String]) -> Result<InstructionProgram> {
    if ops.is_empty() {
        bail!("At least one --op is required");
    }

    let mut program = InstructionProgram::default();
    let mut current = "X".to_string();
    for (i, opcode) in ops.iter().enumerate() {
        let next = if i + 1 == ops.len() {
            "Y".to_string()
        } else {
            format!("T{}", i + 1)
        };
        if BinaryOp::from_opcode(opcode).is_some() {
            program.push(Instruction::binary(opcode.as_str(), &current, "X", &next));
        } else {
            program.push(Instruction::unary(opcode.as_str(), &current, &next));
        }
        if current != "X" {
            program.push(Instruction::remove_variable(&current));
        }
        current = next;
    }
    Ok(program)
}

fn print_matrix(matrix: &Matrix) {
    const MAX_ROWS: usize = 8;
    const MAX_COLS: usize = 8;

    let shape = matrix.shape();
    for row in 0..shape.rows.min(MAX_ROWS) {
        let cells: Vec<String> = (0..shape.cols.min(MAX_COLS))
            .filter_map(|col| matrix.get(row, col))
            .map(|v| format!("{v:>10.4}"))
            .collect();
        let ellipsis = if shape.cols > MAX_COLS { " ..." } else { "" };
        println!("  {}{ellipsis}", cells.join(" "));
    }
    if shape.rows > MAX_ROWS {
        println!("  ... ({} more rows)", shape.rows - MAX_ROWS);
    }
}
