//! don-p2p-sim binary entrypoint.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use don_p2p_sim::cli::{Cli, Commands, Format, RunArgs};
use don_p2p_sim::{Scenario, run};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut stdout = io::stdout().lock();
    match cli.command {
        Commands::Example => {
            serde_json::to_writer_pretty(&mut stdout, &Scenario::example())?;
            writeln!(stdout)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run_scenario(&args, cli.format, &mut stdout).await,
    }
}

async fn run_scenario(args: &RunArgs, format: Format, out: &mut impl Write) -> anyhow::Result<ExitCode> {
    let scenario = match &args.scenario {
        Some(path) => Scenario::from_file(path)
            .with_context(|| format!("loading scenario {}", path.display()))?,
        None => Scenario::example(),
    };

    let report = run(&scenario, &args.options()).await.context("running scenario")?;
    match format {
        Format::Table => report.write_table(out)?,
        Format::Json => report.write_json(out)?,
    }

    if args.strict && !report.converged() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
