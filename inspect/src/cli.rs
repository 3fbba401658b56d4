//! CLI command implementations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use codemod_runner::core::case_codec::{SurfaceAgnosticCase, SurfaceAgnosticJob};
use codemod_runner::exit_codes;
use codemod_runner::io::apply::FsApplier;
use codemod_runner::io::case_log::{CaseReadout, read_case_file};
use codemod_runner::recorder::{ARTIFACT_DIR_NAME, CASE_FILE_NAME};
use serde::Serialize;
use tracing::debug;

use crate::replay::{Replay, seed_from_target};

#[derive(Serialize)]
struct ShowOutput<'a> {
    verified: bool,
    error: Option<String>,
    case: Option<&'a SurfaceAgnosticCase>,
    jobs: &'a [SurfaceAgnosticJob],
}

/// Accept either `case.bin` or the case directory holding it.
fn resolve_case_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CASE_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

fn read(path: &Path) -> Result<(PathBuf, CaseReadout)> {
    let case_path = resolve_case_path(path);
    let readout = read_case_file(&case_path)?;
    debug!(path = %case_path.display(), jobs = readout.jobs.len(), "case read");
    Ok((case_path, readout))
}

/// Print whatever decodes, verified or not.
pub fn show(path: &Path) -> Result<i32> {
    let (_, readout) = read(path)?;
    let output = ShowOutput {
        verified: readout.trailer_verified(),
        error: readout.error.as_ref().map(ToString::to_string),
        case: readout.case.as_ref(),
        jobs: &readout.jobs,
    };
    let json = serde_json::to_string_pretty(&output).context("serialize case")?;
    println!("{json}");
    Ok(verdict_code(&readout))
}

pub fn verify(path: &Path) -> Result<i32> {
    let (case_path, readout) = read(path)?;
    let jobs = readout.jobs.len();
    match readout.into_verified() {
        Ok(log) => {
            println!(
                "verify: ok jobs={} trailer={}",
                jobs,
                hex::encode(log.trailer_digest)
            );
            Ok(exit_codes::OK)
        }
        Err(err) => {
            println!(
                "verify: failed path={} jobs_read={} error={}",
                case_path.display(),
                jobs,
                err
            );
            Ok(exit_codes::CORRUPT)
        }
    }
}

pub fn replay(path: &Path, into: &Path, seed: bool, artifacts: Option<&Path>) -> Result<i32> {
    let (case_path, readout) = read(path)?;
    let log = match readout.into_verified() {
        Ok(log) => log,
        Err(err) => {
            println!("replay: refused error={err}");
            return Ok(exit_codes::CORRUPT);
        }
    };

    let artifacts = match artifacts {
        Some(dir) => dir.to_path_buf(),
        None => case_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(ARTIFACT_DIR_NAME),
    };
    let target = PathBuf::from(&log.case.absolute_target_path);
    if seed {
        // The case root itself may sit inside the target.
        let excluded: Vec<PathBuf> = fs::canonicalize(&case_path)
            .ok()
            .and_then(|path| path.parent()?.parent().map(Path::to_path_buf))
            .into_iter()
            .collect();
        let copied = seed_from_target(&target, into, &excluded)?;
        println!("replay: seeded files={copied} into={}", into.display());
    }

    let replay = Replay::new(target, into.to_path_buf(), artifacts);
    let report = replay.run(&log.jobs, &mut FsApplier);
    for failure in &report.failures {
        eprintln!("replay: job {} failed: {}", failure.index, failure.message);
    }
    println!(
        "replay: applied={} failed={} into={}",
        report.applied,
        report.failures.len(),
        into.display()
    );
    if report.failures.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::PARTIAL)
    }
}

fn verdict_code(readout: &CaseReadout) -> i32 {
    if readout.trailer_verified() {
        exit_codes::OK
    } else {
        exit_codes::CORRUPT
    }
}
