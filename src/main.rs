//! armshake
//!
//! Command-line entry point for the hidden-instruction fuzzer: parses the
//! CLI, builds a validated [`armshake::RunConfig`], wires up the oracle
//! pair, the selected execution back-end, and the status/log sinks, then
//! runs the driver to completion.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};

use armshake::cli::Cli;
use armshake::config::Backend;
use armshake::error::Result;
use armshake::exec::traced::TracedExecutor;
use armshake::exec::Executor;
use armshake::log::{FileLogSink, LogSink};
use armshake::oracle::{CapstoneOracle, LibopcOracle, Oracle};
use armshake::status::{FileStatusSink, StdoutStatusSink, StatusSink};
use armshake::Driver;

/// Where persistent state (`log`/`status`) is written, relative to the
/// current directory. Matches the reference tool's `data/` layout.
const DATA_DIR: &str = "data";

fn main() -> ExitCode {
    // `--help`/`-h` exits 1 per the specification's CLI table, rather than
    // clap's usual 0 — so help is parsed out before falling back to the
    // normal try_parse() error path, which does match the spec.
    let args: Vec<String> = std::env::args().collect();
    if args.iter().skip(1).any(|a| a == "-h" || a == "--help") {
        Cli::command().print_help().ok();
        println!();
        return ExitCode::FAILURE;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.verbose {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("armshake=debug"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("armshake: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = armshake::RunConfig::from_cli(&cli)?;

    let mut cs = CapstoneOracle::new()?;
    let scratch_dir = std::env::temp_dir().join("armshake-scratch");
    std::fs::create_dir_all(&scratch_dir)?;
    let mut libopc = LibopcOracle::new("objdump", scratch_dir);

    let data_dir = PathBuf::from(DATA_DIR);
    let mut file_status = FileStatusSink::new(&data_dir, &config.log_suffix)?;
    let mut stdout_status = StdoutStatusSink::new(config.quiet);
    let mut status_sink = TeeStatusSink {
        file: &mut file_status,
        stdout: &mut stdout_status,
    };
    let mut log_sink = FileLogSink::new(&data_dir, &config.log_suffix)?;

    let counters = match config.backend {
        Backend::InProcess => {
            let mut executor = inprocess_executor(config.isa)?;
            run_driver(config, &mut cs, &mut libopc, &mut *executor, &mut status_sink, &mut log_sink)?
        }
        Backend::Traced => {
            let mut executor = TracedExecutor::new(config.isa)?;
            run_driver(config, &mut cs, &mut libopc, &mut executor, &mut status_sink, &mut log_sink)?
        }
    };

    if !cli.quiet {
        println!(
            "\nchecked={} skipped={} filtered={} discrepancies={} hidden_found={}",
            counters.checked,
            counters.skipped,
            counters.filtered,
            counters.discrepancies,
            counters.hidden_found,
        );
    }

    Ok(())
}

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
fn inprocess_executor(
    isa: armshake::InstructionSet,
) -> Result<Box<dyn Executor>> {
    Ok(Box::new(armshake::exec::inprocess::InProcessExecutor::new(isa)?))
}

#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
fn inprocess_executor(_isa: armshake::InstructionSet) -> Result<Box<dyn Executor>> {
    Err(armshake::FuzzError::Config {
        message: "the in-process executor is only available on arm/aarch64 hosts".into(),
    })
}

fn run_driver(
    config: armshake::RunConfig,
    cs: &mut dyn Oracle,
    libopc: &mut dyn Oracle,
    executor: &mut dyn Executor,
    status_sink: &mut dyn StatusSink,
    log_sink: &mut dyn LogSink,
) -> Result<armshake::types::Counters> {
    let mut driver = Driver::new(config, cs, libopc, executor, status_sink, log_sink);
    driver.run()
}

/// Publishes every status snapshot to both the atomic file sink and the
/// stdout line, since the driver only holds one [`StatusSink`].
struct TeeStatusSink<'a> {
    file: &'a mut FileStatusSink,
    stdout: &'a mut StdoutStatusSink,
}

impl StatusSink for TeeStatusSink<'_> {
    fn publish(&mut self, status: &armshake::types::SearchStatus) -> Result<()> {
        self.file.publish(status)?;
        self.stdout.publish(status)
    }
}
