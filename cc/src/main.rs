// mimicc - compile C sources to a MIMI binary
//
// Usage:
//   mimicc blink.c -o blink.mimi
//   mimicc a.c b.c -o prog.mimi

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mimicc")]
#[command(about = "C compiler targeting the MIMI container format")]
#[command(version)]
struct Args {
    /// Input C source files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output .mimi file
    #[arg(short, long, default_value = "a.mimi")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<()> {
    for input in &args.inputs {
        if input.extension().and_then(|e| e.to_str()) != Some("c") {
            bail!("input {} is not a .c file", input.display());
        }
    }
    mimic_cc::compile_and_link(&args.inputs, &args.output)
        .with_context(|| format!("compiling to {}", args.output.display()))?;
    if args.verbose {
        eprintln!("[CC] wrote {}", args.output.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Compile errors carry per-line diagnostics; print them the way
            // the on-device shell does.
            if let Some(ce) = e.downcast_ref::<mimic_cc::CompileError>() {
                for d in &ce.diags {
                    eprintln!("[CC] {d}");
                }
                eprintln!("[CC] failed: {} ({})", ce.code, ce.code.code());
            } else {
                eprintln!("[CC] error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
