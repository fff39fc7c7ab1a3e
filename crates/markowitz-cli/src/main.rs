mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use commands::optimization::{AnalyzeArgs, OptimizeArgs};
use commands::portfolio::{EvaluateArgs, SampleArgs};
use commands::statistics::StatsArgs;
use output::OutputFormat;

/// Mean-variance portfolio analysis
#[derive(Parser)]
#[command(
    name = "mvo",
    version,
    about = "Mean-variance portfolio analysis",
    long_about = "A CLI for Markowitz portfolio analysis over daily closing prices. \
                  Estimates annualised return statistics, scores allocations, samples \
                  random long-only portfolios and solves for the maximum Sharpe ratio \
                  portfolio. Set RUST_LOG (e.g. RUST_LOG=debug) for diagnostics on stderr."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Annualised mean returns, volatilities and covariance
    Stats(StatsArgs),
    /// Expected return, volatility and Sharpe ratio of given weights
    Evaluate(EvaluateArgs),
    /// Monte Carlo sampling of random long-only portfolios
    Sample(SampleArgs),
    /// Solve for the maximum Sharpe ratio portfolio
    Optimize(OptimizeArgs),
    /// Statistics, sampling and optimization in one run
    Analyze(AnalyzeArgs),
    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Stats(args) => commands::statistics::run_stats(args),
        Commands::Evaluate(args) => commands::portfolio::run_evaluate(args),
        Commands::Sample(args) => commands::portfolio::run_sample(args),
        Commands::Optimize(args) => commands::optimization::run_optimize(args),
        Commands::Analyze(args) => commands::optimization::run_analyze(args),
        Commands::Version => {
            println!("mvo {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
