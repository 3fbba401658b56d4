//! Replaying a verified case log into a directory standing in for its target.
//!
//! Job URIs name absolute paths under the recorded target; they are remapped
//! under the replay directory. File bodies come from the artifact directory,
//! looked up by file name, so a case directory can be moved before replay.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use codemod_runner::core::case_codec::{JobKind, SurfaceAgnosticJob};
use codemod_runner::core::types::MutationCommand;
use codemod_runner::io::apply::Applier;
use codemod_runner::io::discover::discover_files_excluding;
use codemod_runner::recorder::path_from_uri;
use tracing::{info, instrument, warn};

#[derive(Debug)]
pub struct ReplayFailure {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub failures: Vec<ReplayFailure>,
}

pub struct Replay {
    target: PathBuf,
    into: PathBuf,
    artifacts: PathBuf,
}

impl Replay {
    pub fn new(target: PathBuf, into: PathBuf, artifacts: PathBuf) -> Self {
        Self {
            target,
            into,
            artifacts,
        }
    }

    /// Apply every job in log order. A failed job is reported and skipped.
    #[instrument(skip_all, fields(into = %self.into.display(), jobs = jobs.len()))]
    pub fn run<A: Applier>(&self, jobs: &[SurfaceAgnosticJob], applier: &mut A) -> ReplayReport {
        let mut report = ReplayReport::default();
        for (index, job) in jobs.iter().enumerate() {
            let outcome = self
                .command_for(job)
                .and_then(|command| applier.apply(&command));
            match outcome {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    warn!(index, kind = ?job.kind, err = %err, "replay job failed");
                    report.failures.push(ReplayFailure {
                        index,
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        info!(
            applied = report.applied,
            failed = report.failures.len(),
            "replay finished"
        );
        report
    }

    pub fn command_for(&self, job: &SurfaceAgnosticJob) -> Result<MutationCommand> {
        let command = match job.kind {
            JobKind::RewriteFile => MutationCommand::UpdateFile {
                path: self.destination(&job.old_uri)?,
                // Applying only needs the new body.
                old_data: String::new(),
                new_data: self.artifact_body(&job.new_uri)?,
            },
            JobKind::CreateFile => MutationCommand::CreateFile {
                path: self.destination(&job.old_uri)?,
                data: self.artifact_body(&job.new_uri)?,
            },
            JobKind::DeleteFile => MutationCommand::DeleteFile {
                path: self.destination(&job.old_uri)?,
            },
            JobKind::MoveFile => MutationCommand::MoveFile {
                from: self.destination(&job.old_uri)?,
                to: self.destination(&job.new_uri)?,
            },
            JobKind::CopyFile => MutationCommand::CopyFile {
                from: self.destination(&job.old_uri)?,
                to: self.destination(&job.new_uri)?,
            },
            JobKind::MoveAndRewriteFile => bail!("move-and-rewrite jobs cannot be replayed"),
        };
        Ok(command)
    }

    fn destination(&self, uri: &str) -> Result<PathBuf> {
        let path = path_from_uri(uri).ok_or_else(|| anyhow!("not a file uri: {uri}"))?;
        let relative = path
            .strip_prefix(&self.target)
            .with_context(|| format!("{} is outside {}", path.display(), self.target.display()))?;
        if relative.as_os_str().is_empty() {
            // A single-file target maps onto the file of the same name.
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("no file name in {uri}"))?;
            return Ok(self.into.join(name));
        }
        if let Some(bad) = relative
            .components()
            .find(|component| !matches!(component, Component::Normal(_)))
        {
            bail!(
                "{uri} escapes the replay directory ({})",
                bad.as_os_str().to_string_lossy()
            );
        }
        Ok(self.into.join(relative))
    }

    fn artifact_body(&self, uri: &str) -> Result<String> {
        let path = path_from_uri(uri).ok_or_else(|| anyhow!("not a file uri: {uri}"))?;
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("artifact uri without a file name: {uri}"))?;
        let artifact = self.artifacts.join(name);
        fs::read_to_string(&artifact)
            .with_context(|| format!("read artifact {}", artifact.display()))
    }
}

/// Copy the files discovery would visit under `target` into `into`,
/// skipping anything under `excluded`.
///
/// Returns the number of files copied.
#[instrument(skip_all, fields(target = %target.display(), into = %into.display()))]
pub fn seed_from_target(target: &Path, into: &Path, excluded: &[PathBuf]) -> Result<usize> {
    let files = discover_files_excluding(target, &[], excluded)?;
    for file in &files {
        let relative = match file.strip_prefix(target) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => PathBuf::from(
                file.file_name()
                    .ok_or_else(|| anyhow!("no file name in {}", file.display()))?,
            ),
        };
        let dest = into.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(file, &dest)
            .with_context(|| format!("copy {} to {}", file.display(), dest.display()))?;
    }
    Ok(files.len())
}
