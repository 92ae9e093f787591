// mimirun - load and run a MIMI binary
//
// Usage:
//   mimirun prog.mimi
//   mimirun -v --fuel 1000000 prog.mimi

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use mimic_rt::fs::HostFs;
use mimic_rt::Machine;

#[derive(Parser, Debug)]
#[command(name = "mimirun")]
#[command(about = "Cooperative runtime for MIMI binaries")]
#[command(version)]
struct Args {
    /// The .mimi binary to run
    input: PathBuf,

    /// Task priority (0 = highest)
    #[arg(short, long, default_value = "10")]
    priority: u8,

    /// Instruction budget before the run is declared stuck
    #[arg(long, default_value = "100000000")]
    fuel: u64,

    /// Bytes fed to getchar()
    #[arg(long)]
    stdin: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<i32> {
    let dir = args
        .input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad input path"))?
        .to_string();

    let mut machine = Machine::new(Box::new(HostFs::new(dir)));
    if let Some(input) = &args.stdin {
        machine.push_input(input.as_bytes());
    }

    machine
        .load_task(&name, args.priority)
        .map_err(|e| anyhow!("[LOAD] {name}: {e} ({})", e.code()))?;
    let code = machine
        .run(args.fuel)
        .map_err(|e| anyhow!("[RUN] {name}: {e} ({})", e.code()));

    let out = machine.take_output();
    std::io::stdout().write_all(&out).context("writing output")?;
    code
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    match run(&args) {
        Ok(code) => {
            if args.verbose {
                eprintln!("[RUN] exit code {code}");
            }
            ExitCode::from((code & 0xFF) as u8)
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
