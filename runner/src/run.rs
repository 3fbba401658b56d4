//! Coordinator entry point for one codemod run.
//!
//! A run is prepared first ([`prepare_run`]: discover files, build the case
//! preamble, open the case log) and then executed against a worker spawner
//! ([`PreparedRun::execute`]). The split lets callers build spawners that
//! need the case directory, such as process workers reading the effective
//! config written there.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::case_codec::SurfaceAgnosticCase;
use crate::core::types::{ArgumentRecord, EngineHint, MutationCommand, ProgressReport};
use crate::io::apply::Applier;
use crate::io::config::{RunConfig, write_config};
use crate::io::discover::discover_files_excluding;
use crate::io::report::{Notification, Reporter};
use crate::io::worker::WorkerSpawner;
use crate::recorder::{AuditRecorder, CASE_FILE_NAME, build_case};
use crate::scheduler::{PoolConfig, PoolEvent, PoolScheduler};

/// Effective config written next to the case log.
pub const EFFECTIVE_CONFIG_NAME: &str = "config.toml";

#[derive(Debug, Clone)]
pub struct RunRequest {
    /// File or directory to transform.
    pub target: PathBuf,
    pub engine: EngineHint,
    /// Bytes identifying the codemod (template source or command line).
    pub codemod_source: Vec<u8>,
    pub arguments: ArgumentRecord,
    pub config: RunConfig,
    /// Record commands without applying them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub case_path: PathBuf,
    pub progress: ProgressReport,
    /// Commands recorded in the case log.
    pub changed: usize,
    pub job_errors: usize,
    pub apply_errors: usize,
    pub record_errors: usize,
    pub abandoned: Vec<PathBuf>,
}

impl RunSummary {
    /// No job, record or apply failed and nothing was abandoned.
    pub fn is_clean(&self) -> bool {
        self.job_errors == 0
            && self.apply_errors == 0
            && self.record_errors == 0
            && self.abandoned.is_empty()
    }
}

/// Discovered work plus an open case log, ready to execute.
pub struct PreparedRun {
    request: RunRequest,
    files: Vec<PathBuf>,
    case: SurfaceAgnosticCase,
    case_dir: PathBuf,
    recorder: AuditRecorder<std::io::BufWriter<fs::File>>,
}

impl PreparedRun {
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn case(&self) -> &SurfaceAgnosticCase {
        &self.case
    }

    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    pub fn case_path(&self) -> PathBuf {
        self.case_dir.join(CASE_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.case_dir.join(EFFECTIVE_CONFIG_NAME)
    }

    /// Run the pool, recording (and unless dry-run, applying) every command.
    ///
    /// Job, record and apply failures are reported and counted; only a
    /// failure to start the pool or to close the case log fails the run.
    #[instrument(skip_all, fields(case_dir = %self.case_dir.display(), files = self.files.len()))]
    pub fn execute<S, A, W>(
        self,
        spawner: S,
        applier: &mut A,
        reporter: &mut Reporter<W>,
    ) -> Result<RunSummary>
    where
        S: WorkerSpawner,
        A: Applier,
        W: Write,
    {
        let Self {
            request,
            files,
            case_dir,
            mut recorder,
            ..
        } = self;

        let scheduler = PoolScheduler::start(
            spawner,
            PoolConfig::from_run_config(&request.config),
            request.engine,
            request.arguments.clone(),
            files,
        )?;

        let mut sink = EventSink {
            recorder: &mut recorder,
            applier: &mut *applier,
            reporter: &mut *reporter,
            dry_run: request.dry_run,
            changed: 0,
            record_errors: 0,
            apply_errors: 0,
            report_failed: false,
        };
        let pool = scheduler.run(|event| sink.handle(event));
        let (changed, record_errors, apply_errors) =
            (sink.changed, sink.record_errors, sink.apply_errors);

        recorder.finish().context("write case trailer")?;
        let summary = RunSummary {
            case_path: case_dir.join(CASE_FILE_NAME),
            progress: pool.progress,
            changed,
            job_errors: pool.job_errors,
            apply_errors,
            record_errors,
            abandoned: pool.abandoned,
        };

        let finish = Notification::Finish {
            processed: summary.progress.processed,
            total: summary.progress.total,
            changed: summary.changed,
            errors: summary.job_errors + summary.apply_errors + summary.record_errors,
            abandoned: summary.abandoned.len(),
            dry_run: request.dry_run,
            case_path: &summary.case_path,
        };
        if let Err(err) = reporter.emit(&finish) {
            warn!(err = %err, "failed to write finish notification");
        }
        info!(
            processed = summary.progress.processed,
            total = summary.progress.total,
            changed = summary.changed,
            clean = summary.is_clean(),
            "run finished"
        );
        Ok(summary)
    }
}

/// Discover files, write the preamble and the effective config.
#[instrument(skip_all, fields(target = %request.target.display(), engine = %request.engine))]
pub fn prepare_run(request: RunRequest) -> Result<PreparedRun> {
    request.config.validate()?;
    let target = fs::canonicalize(&request.target)
        .with_context(|| format!("resolve target {}", request.target.display()))?;
    let case_root = case_root(&target, &request.config.case_dir);
    // Earlier cases under the target are never inputs.
    let excluded = [fs::canonicalize(&case_root).unwrap_or_else(|_| case_root.clone())];
    let files = discover_files_excluding(&target, &request.config.extensions, &excluded)?;

    let created_at = Utc::now().timestamp_millis();
    let case = build_case(
        &request.codemod_source,
        &target,
        created_at,
        request.arguments.clone(),
    );

    let case_dir = case_root.join(hex::encode(case.case_hash_digest));
    let mut recorder = AuditRecorder::create(&case_dir)?;
    recorder.begin(&case)?;
    write_config(&case_dir.join(EFFECTIVE_CONFIG_NAME), &request.config)?;

    info!(files = files.len(), case_dir = %case_dir.display(), "run prepared");
    Ok(PreparedRun {
        request: RunRequest { target, ..request },
        files,
        case,
        case_dir,
        recorder,
    })
}

/// Prepare and execute in one step.
pub fn run_codemod<S, A, W>(
    request: RunRequest,
    spawner: S,
    applier: &mut A,
    reporter: &mut Reporter<W>,
) -> Result<RunSummary>
where
    S: WorkerSpawner,
    A: Applier,
    W: Write,
{
    prepare_run(request)?.execute(spawner, applier, reporter)
}

/// Relative case dirs live under the target directory (or a target file's parent).
fn case_root(target: &Path, case_dir: &Path) -> PathBuf {
    if case_dir.is_absolute() {
        return case_dir.to_path_buf();
    }
    let base = if target.is_dir() {
        target
    } else {
        target.parent().unwrap_or(target)
    };
    base.join(case_dir)
}

struct EventSink<'a, R: Write, A: Applier, W: Write> {
    recorder: &'a mut AuditRecorder<R>,
    applier: &'a mut A,
    reporter: &'a mut Reporter<W>,
    dry_run: bool,
    changed: usize,
    record_errors: usize,
    apply_errors: usize,
    report_failed: bool,
}

impl<R: Write, A: Applier, W: Write> EventSink<'_, R, A, W> {
    fn handle(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Commands { path, commands, .. } => {
                for command in &commands {
                    self.apply(&path, command);
                }
            }
            PoolEvent::JobError { path, message, .. } => {
                self.notify(&Notification::Error {
                    path: &path,
                    message: &message,
                });
            }
            PoolEvent::Progress(progress) => self.notify(&progress.into()),
            PoolEvent::Hang { path, .. } => self.notify(&Notification::Hang { path: &path }),
            PoolEvent::Finished(_) => {}
        }
    }

    /// Record first; a command that cannot be recorded is not applied.
    fn apply(&mut self, path: &Path, command: &MutationCommand) {
        if let Err(err) = self.recorder.record(command) {
            self.record_errors += 1;
            let message = format!("record: {err:#}");
            self.notify(&Notification::Error {
                path,
                message: &message,
            });
            return;
        }
        self.changed += 1;
        if self.dry_run {
            return;
        }
        if let Err(err) = self.applier.apply(command) {
            self.apply_errors += 1;
            let message = format!("apply: {err:#}");
            self.notify(&Notification::Error {
                path,
                message: &message,
            });
        }
    }

    fn notify(&mut self, notification: &Notification<'_>) {
        if let Err(err) = self.reporter.emit(notification) {
            if !self.report_failed {
                warn!(err = %err, "progress reporting failed; continuing without it");
            }
            self.report_failed = true;
        }
    }
}
