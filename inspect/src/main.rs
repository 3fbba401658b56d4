mod cli;
mod replay;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codemod_runner::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "case-inspect",
    version,
    about = "Read, verify and replay codemod case logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the preamble and jobs as JSON.
    Show {
        /// `case.bin` or the case directory holding it.
        case: PathBuf,
    },
    /// Check every frame digest and the trailer.
    Verify { case: PathBuf },
    /// Re-apply the recorded jobs into another directory.
    Replay {
        case: PathBuf,
        /// Directory standing in for the recorded target.
        #[arg(long)]
        into: PathBuf,
        /// Copy the recorded target's files into --into first.
        #[arg(long)]
        seed: bool,
        /// Artifact directory [default: artifacts/ next to the case file].
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Show { case } => cli::show(&case),
        Command::Verify { case } => cli::verify(&case),
        Command::Replay {
            case,
            into,
            seed,
            artifacts,
        } => cli::replay(&case, &into, seed, artifacts.as_deref()),
    }
}
