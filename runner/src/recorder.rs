//! Audit recorder: turns mutation commands into case log records.
//!
//! Every command becomes one [`SurfaceAgnosticJob`]. Paths are recorded as
//! `file://` URIs. File bodies (created or rewritten files) are stored in a
//! content-addressed artifact directory next to the case log and referenced
//! by the job's `new_uri`, so a case can be replayed without the workers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::case_codec::{
    CaseDigest, JobKind, SurfaceAgnosticCase, SurfaceAgnosticJob, ripemd160,
};
use crate::core::types::{ArgumentRecord, MutationCommand};
use crate::io::case_log::{CaseWriter, create_case_file};

pub const CASE_FILE_NAME: &str = "case.bin";
pub const ARTIFACT_DIR_NAME: &str = "artifacts";

const FILE_SCHEME: &str = "file://";

pub fn file_uri(path: &Path) -> String {
    format!("{FILE_SCHEME}{}", path.display())
}

/// Inverse of [`file_uri`]. `None` for anything that is not a file URI.
pub fn path_from_uri(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix(FILE_SCHEME)
        .filter(|rest| !rest.is_empty())
        .map(PathBuf::from)
}

/// Digest identifying one job: RIPEMD-160 over kind ∥ old URI ∥ new URI.
pub fn job_hash(kind: JobKind, old_uri: &str, new_uri: &str) -> CaseDigest {
    let mut buf = Vec::with_capacity(1 + old_uri.len() + new_uri.len());
    buf.push(kind.as_byte());
    buf.extend_from_slice(old_uri.as_bytes());
    buf.extend_from_slice(new_uri.as_bytes());
    ripemd160(&buf)
}

/// Build the run preamble.
///
/// The case digest covers the codemod digest, the target path and the
/// creation time, so two runs of the same codemod get distinct cases.
pub fn build_case(
    codemod_source: &[u8],
    target: &Path,
    created_at_millis: i64,
    arguments: ArgumentRecord,
) -> SurfaceAgnosticCase {
    let codemod_hash_digest = ripemd160(codemod_source);
    let absolute_target_path = target.display().to_string();

    let mut buf = Vec::new();
    buf.extend_from_slice(&codemod_hash_digest);
    buf.extend_from_slice(absolute_target_path.as_bytes());
    buf.extend_from_slice(&created_at_millis.to_be_bytes());

    SurfaceAgnosticCase {
        case_hash_digest: ripemd160(&buf),
        codemod_hash_digest,
        created_at: created_at_millis,
        absolute_target_path,
        argument_record: arguments,
    }
}

/// Content-addressed store for file bodies referenced by case jobs.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `data` under its digest and return its URI. Identical bodies share one file.
    pub fn store(&self, data: &str) -> Result<String> {
        let path = self.dir.join(hex::encode(ripemd160(data.as_bytes())));
        if !path.exists() {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
            fs::write(&path, data).with_context(|| format!("write artifact {}", path.display()))?;
        }
        Ok(file_uri(&path))
    }
}

pub struct AuditRecorder<W: Write> {
    writer: CaseWriter<W>,
    artifacts: ArtifactStore,
}

impl AuditRecorder<BufWriter<File>> {
    /// Open `case_dir/case.bin` with artifacts under `case_dir/artifacts`.
    #[instrument(skip_all, fields(case_dir = %case_dir.display()))]
    pub fn create(case_dir: &Path) -> Result<Self> {
        let writer = create_case_file(&case_dir.join(CASE_FILE_NAME))?;
        let artifacts = ArtifactStore::new(case_dir.join(ARTIFACT_DIR_NAME));
        Ok(Self::new(writer, artifacts))
    }
}

impl<W: Write> AuditRecorder<W> {
    pub fn new(writer: CaseWriter<W>, artifacts: ArtifactStore) -> Self {
        Self { writer, artifacts }
    }

    pub fn begin(&mut self, case: &SurfaceAgnosticCase) -> Result<()> {
        if !self.writer.write_preamble(case)? {
            return Err(anyhow!("case preamble already written"));
        }
        Ok(())
    }

    /// Append one command to the log and return the record written.
    pub fn record(&mut self, command: &MutationCommand) -> Result<SurfaceAgnosticJob> {
        let job = self.job_for(command)?;
        if !self.writer.write_job(&job)? {
            return Err(anyhow!(
                "case log is not accepting jobs ({:?})",
                self.writer.state()
            ));
        }
        debug!(kind = ?job.kind, old = %job.old_uri, new = %job.new_uri, "recorded job");
        Ok(job)
    }

    /// Write the trailer. Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }

    pub fn jobs_recorded(&self) -> usize {
        self.writer.jobs_written()
    }

    pub fn into_writer(self) -> CaseWriter<W> {
        self.writer
    }

    fn job_for(&self, command: &MutationCommand) -> Result<SurfaceAgnosticJob> {
        let (kind, old_uri, new_uri) = match command {
            MutationCommand::UpdateFile { path, new_data, .. } => (
                JobKind::RewriteFile,
                file_uri(path),
                self.artifacts.store(new_data)?,
            ),
            MutationCommand::CreateFile { path, data } => (
                JobKind::CreateFile,
                file_uri(path),
                self.artifacts.store(data)?,
            ),
            MutationCommand::DeleteFile { path } => {
                (JobKind::DeleteFile, file_uri(path), String::new())
            }
            MutationCommand::MoveFile { from, to } => {
                (JobKind::MoveFile, file_uri(from), file_uri(to))
            }
            MutationCommand::CopyFile { from, to } => {
                (JobKind::CopyFile, file_uri(from), file_uri(to))
            }
        };
        Ok(SurfaceAgnosticJob {
            job_hash_digest: job_hash(kind, &old_uri, &new_uri),
            kind,
            old_uri,
            new_uri,
        })
    }
}
