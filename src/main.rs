use clap::Parser;
use color_eyre::eyre::{self, eyre, WrapErr};
use smpsim::{stepping, DotConfig, MachineConfig, Outcome, Simulator};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(author, version, about = "bus-based MESI multiprocessor simulator", long_about = None)]
struct Options {
    /// Assembly program to run on every PE; the built-in dot-product
    /// kernel when absent.
    program: Option<PathBuf>,

    /// Step interactively instead of running to completion.
    #[arg(short, long)]
    step: bool,

    /// File with the A and B vectors, one whitespace-separated line each.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Vector length of the dot-product workload.
    #[arg(short, long, default_value_t = 16)]
    n: usize,

    /// Write final metrics as JSON.
    #[arg(long, value_name = "FILE")]
    stats_out: Option<PathBuf>,

    /// Safety cap on ticks for batch runs.
    #[arg(long, default_value_t = 100_000)]
    max_ticks: u64,
}

/// Parse the two vector lines. Unused trailing lines are ignored; short
/// vectors are zero-filled by the loader.
fn load_vectors(path: &Path) -> eyre::Result<(Vec<f64>, Vec<f64>)> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read input {}", path.display()))?;
    let mut rows = text.lines().filter(|line| !line.trim().is_empty());
    let mut parse_row = |name: &str| -> eyre::Result<Vec<f64>> {
        let Some(row) = rows.next() else {
            return Err(eyre!("input {} is missing the {name} vector", path.display()));
        };
        row.split_whitespace()
            .map(|token| {
                token
                    .parse()
                    .wrap_err_with(|| format!("bad {name} element `{token}`"))
            })
            .collect()
    };
    let a = parse_row("A")?;
    let b = parse_row("B")?;
    Ok((a, b))
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();

    let (a, b) = match &options.input {
        Some(path) => load_vectors(path)?,
        // default workload: A[i] = i + 1, B[i] = 1
        None => (
            (0..options.n).map(|i| i as f64 + 1.0).collect(),
            vec![1.0; options.n],
        ),
    };

    let mut simulator = Simulator::new(MachineConfig::default());
    simulator.init_dot_problem(
        DotConfig {
            n: options.n,
            ..DotConfig::default()
        },
        &a,
        &b,
    )?;

    match &options.program {
        Some(path) => {
            log::info!("loading program from {}", path.display());
            simulator.load_program_all_from_file(path)?;
        }
        None => simulator.load_program_all(&Simulator::demo_program()),
    }

    if options.step {
        stepping::run(&simulator);
    } else {
        let outcome = simulator.run_until_done(options.max_ticks);
        if let Outcome::TimedOut { ticks } = outcome {
            return Err(eyre!("simulation did not converge within {ticks} ticks"));
        }
    }

    let result = simulator.final_reduce();
    let reference = simulator.reference_dot();
    println!("\n{}", simulator.summary());
    for pe in 0..simulator.config().num_pes {
        println!("partial_sums[{pe}] = {:.6}", simulator.partial_sum(pe));
    }
    println!("dot(A, B)        = {result:.6}");
    println!("CPU reference    = {reference:.6}");

    if let Some(path) = &options.stats_out {
        let stats = simulator.stats();
        let writer = fs::File::create(path)
            .wrap_err_with(|| format!("cannot write stats to {}", path.display()))?;
        serde_json::to_writer_pretty(writer, &stats)?;
        log::info!("stats written to {}", path.display());
    }

    Ok(())
}
