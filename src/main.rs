//! laminate CLI: one calibration run from a TOML configuration.
//!
//! Loads the configuration (defaults when none is given), runs both stages
//! and prints the measured / predicted comparison plus the stage reports.
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use laminate::config::Config;
use laminate::optimizer::calibrate;
use laminate::precision::PrecisionKind;
use laminate::types::{CalibrationSummary, Coefficient, StageReport, PARAMETER_NAMES};

/// Identify two-layer laminate parameters from measured effective coefficients
#[derive(Parser, Debug)]
#[command(name = "laminate")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// TOML run configuration
    ///
    /// Omitted tables and keys keep their defaults; without a file the
    /// reference targets and the literal seed are used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the stage A precision (single | double)
    #[arg(long, value_name = "PRECISION")]
    stage_a_precision: Option<PrecisionKind>,

    /// Override the stage B precision (single | double)
    #[arg(long, value_name = "PRECISION")]
    stage_b_precision: Option<PrecisionKind>,

    /// Print the sampled loss trace after the run
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(p) = cli.stage_a_precision {
        config.options.precision.stage_a = p;
    }
    if let Some(p) = cli.stage_b_precision {
        config.options.precision.stage_b = p;
    }

    match calibrate(&config.targets, &config.seed, &config.options) {
        Ok(summary) => {
            print_summary(&config, &summary, cli.trace);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("calibration failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_summary(config: &Config, summary: &CalibrationSummary, trace: bool) {
    if let Some(source) = &config.source {
        println!("config: {}", source.display());
    }

    println!("\n{:<8} {:>22} {:>22} {:>12}", "coeff", "measured", "predicted", "abs error");
    for c in Coefficient::ALL {
        let measured = config.targets.get(c);
        let predicted = summary.coefficients[c];
        println!(
            "{:<8} {:>22.15} {:>22.15} {:>12.3e}",
            c.name(),
            measured,
            predicted,
            (predicted - measured).abs()
        );
    }

    println!("\n{:<8} {:>22}", "param", "value");
    let theta = summary.parameters.to_array();
    for (name, value) in PARAMETER_NAMES.iter().zip(theta) {
        println!("{name:<8} {value:>22.15}");
    }
    println!("{:<8} {:>22.15}", "d2", summary.parameters.d2());

    println!();
    print_stage(&summary.stage_a);
    print_stage(&summary.stage_b);
    println!("final loss = {:.6e}", summary.loss);

    if trace {
        println!("\n{:<6} {:>6} {:>14}", "stage", "iter", "loss");
        for p in &summary.trace {
            println!("{:<6} {:>6} {:>14.6e}", p.stage, p.iteration, p.loss);
        }
    }
}

fn print_stage(r: &StageReport) {
    println!(
        "{:<6} [{}] {} iterations, {} evaluations, loss = {:.6e} ({})",
        r.stage, r.precision, r.iterations, r.evaluations, r.final_loss, r.stop
    );
}
