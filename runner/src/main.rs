//! Batch codemod runner CLI.
//!
//! `codemod-runner run` transforms every file under a target on a pool of
//! workers and writes a case log; `codemod-runner worker` is the hidden
//! worker-process mode the pool re-executes itself as.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use codemod_runner::core::types::{ArgumentRecord, EngineHint, parse_argument_pair};
use codemod_runner::exit_codes;
use codemod_runner::io::apply::FsApplier;
use codemod_runner::io::config::{RunConfig, WorkerKind, default_config_path, load_config};
use codemod_runner::io::report::Reporter;
use codemod_runner::io::transformer::{EngineFactory, TransformerFactory};
use codemod_runner::io::worker::{
    ProcessSpawner, ThreadSpawner, limit_address_space, serve_stdio, worker_mode_args,
};
use codemod_runner::logging;
use codemod_runner::run::{RunRequest, RunSummary, prepare_run};

#[derive(Parser)]
#[command(
    name = "codemod-runner",
    version,
    about = "Run a codemod over many files on a pool of isolated workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transform every file under TARGET and record a case log.
    Run(RunArgs),
    /// Serve jobs over stdin/stdout (spawned by `run` for process workers).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// File or directory to transform.
    target: PathBuf,

    /// Transformation template.
    #[arg(short, long)]
    transform: Option<PathBuf>,

    /// Engine to use; inferred from --transform or the trailing command when omitted.
    #[arg(long)]
    engine: Option<EngineHint>,

    /// Config file [default: TARGET/codemod.toml].
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transformation option as key=value; values are parsed as JSON when possible.
    #[arg(short = 'a', long = "arg", value_parser = parse_argument_pair)]
    arguments: Vec<(String, serde_json::Value)>,

    /// Record the case log without touching any file.
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    pool_size: Option<usize>,

    #[arg(long)]
    hang_threshold_ms: Option<u64>,

    #[arg(long, value_enum)]
    worker: Option<WorkerKind>,

    /// Only transform files with this extension (repeatable).
    #[arg(long = "ext")]
    extensions: Vec<String>,

    #[arg(long)]
    case_dir: Option<PathBuf>,

    /// Command engine program and arguments, after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Effective config written by the coordinator.
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    transform: Option<PathBuf>,
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
        Command::Run(args) => cmd_run(args),
        Command::Worker(args) => cmd_worker(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&args.target));
    let mut config = load_config(&config_path)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let engine = resolve_engine(&args, &config)?;
    let transform = match engine {
        EngineHint::Template => {
            let path = args
                .transform
                .as_deref()
                .ok_or_else(|| anyhow!("the template engine needs --transform FILE"))?;
            Some(
                fs::canonicalize(path)
                    .with_context(|| format!("resolve transform {}", path.display()))?,
            )
        }
        EngineHint::Command => None,
    };
    let source = transform
        .as_deref()
        .map(|path| {
            fs::read_to_string(path).with_context(|| format!("read transform {}", path.display()))
        })
        .transpose()?;
    let codemod_source = match &source {
        Some(source) => source.clone().into_bytes(),
        None => config.command.program.join("\0").into_bytes(),
    };

    // Compile once here so a broken transformation fails the run up front.
    let factory = EngineFactory::new(source.as_deref(), &config)?;
    factory.load(engine).context("load transformation")?;

    let request = RunRequest {
        target: args.target.clone(),
        engine,
        codemod_source,
        arguments: args.arguments.iter().cloned().collect::<ArgumentRecord>(),
        config: config.clone(),
        dry_run: args.dry_run,
    };
    let prepared = prepare_run(request)?;

    let mut applier = FsApplier;
    let stdout = std::io::stdout();
    let mut reporter = Reporter::new(stdout.lock());
    let summary = match config.worker.kind {
        WorkerKind::Thread => {
            let spawner = ThreadSpawner::new(Arc::new(factory), config.worker.stack_bytes);
            prepared.execute(spawner, &mut applier, &mut reporter)?
        }
        WorkerKind::Process => {
            let spawner = ProcessSpawner::current_exe(worker_mode_args(
                &prepared.config_path(),
                transform.as_deref(),
            ))?;
            prepared.execute(spawner, &mut applier, &mut reporter)?
        }
    };
    Ok(exit_code(&summary))
}

fn cmd_worker(args: WorkerArgs) -> Result<i32> {
    let config = load_config(&args.config)?;
    let source = args
        .transform
        .as_deref()
        .map(|path| {
            fs::read_to_string(path).with_context(|| format!("read transform {}", path.display()))
        })
        .transpose()?;
    let factory = EngineFactory::new(source.as_deref(), &config)?;
    if config.sandbox.memory_limit_bytes != 0 {
        limit_address_space(config.sandbox.memory_limit_bytes)?;
    }

    // Same stack budget as a thread worker.
    let handle = thread::Builder::new()
        .name("codemod-worker".to_string())
        .stack_size(config.worker.stack_bytes)
        .spawn(move || serve_stdio(&factory))
        .context("spawn worker thread")?;
    handle
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))??;
    Ok(exit_codes::OK)
}

fn apply_overrides(config: &mut RunConfig, args: &RunArgs) {
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(hang_threshold_ms) = args.hang_threshold_ms {
        config.hang_threshold_ms = hang_threshold_ms;
    }
    if let Some(kind) = args.worker {
        config.worker.kind = kind;
    }
    if !args.extensions.is_empty() {
        config.extensions = args.extensions.clone();
    }
    if let Some(case_dir) = &args.case_dir {
        config.case_dir = case_dir.clone();
    }
    if !args.command.is_empty() {
        config.command.program = args.command.clone();
    }
}

fn resolve_engine(args: &RunArgs, config: &RunConfig) -> Result<EngineHint> {
    if let Some(engine) = args.engine {
        return Ok(engine);
    }
    if args.transform.is_some() {
        return Ok(EngineHint::Template);
    }
    if !config.command.program.is_empty() {
        return Ok(EngineHint::Command);
    }
    bail!("nothing to run: pass --transform FILE or a command after --")
}

fn exit_code(summary: &RunSummary) -> i32 {
    if summary.is_clean() {
        exit_codes::OK
    } else {
        exit_codes::PARTIAL
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::Path;

    use super::*;

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::parse_from([
            "codemod-runner",
            "run",
            "src",
            "--transform",
            "rename.j2",
            "--arg",
            "depth=2",
            "-a",
            "name=foo",
            "--dry-run",
            "--worker",
            "process",
            "--ext",
            "ts",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.target, PathBuf::from("src"));
        assert_eq!(args.transform, Some(PathBuf::from("rename.j2")));
        assert!(args.dry_run);
        assert_eq!(args.worker, Some(WorkerKind::Process));
        assert_eq!(
            args.arguments,
            vec![
                ("depth".to_string(), serde_json::json!(2)),
                ("name".to_string(), serde_json::json!("foo")),
            ]
        );
        assert_eq!(args.extensions, vec!["ts".to_string()]);
    }

    #[test]
    fn trailing_command_selects_command_engine() {
        let cli = Cli::parse_from(["codemod-runner", "run", ".", "--", "sed", "-e", "s/a/b/"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = RunConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.command.program, vec!["sed", "-e", "s/a/b/"]);
        assert_eq!(resolve_engine(&args, &config).unwrap(), EngineHint::Command);
    }

    #[test]
    fn engine_is_required_without_transform_or_command() {
        let cli = Cli::parse_from(["codemod-runner", "run", "."]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(resolve_engine(&args, &RunConfig::default()).is_err());
    }

    #[test]
    fn worker_args_select_worker_mode() {
        let args = worker_mode_args(Path::new("/c/config.toml"), Some(Path::new("/t.j2")));
        let cli = Cli::parse_from(
            std::iter::once(OsString::from("codemod-runner")).chain(args),
        );
        let Command::Worker(worker) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(worker.config, PathBuf::from("/c/config.toml"));
        assert_eq!(worker.transform, Some(PathBuf::from("/t.j2")));
    }
}
