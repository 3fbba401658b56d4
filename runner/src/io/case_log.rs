//! Writer and reader for surface-agnostic case logs.
//!
//! The writer enforces `preamble → job* → trailer`. Calls made out of that
//! sequence are dropped without error so a misbehaving caller can never damage
//! a record that is already durable. The reader enforces the same sequence and
//! verifies every digest before exposing a record.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::case_codec::{
    CaseCodecError, CaseDigest, Frame, RunningDigest, SurfaceAgnosticCase, SurfaceAgnosticJob,
    decode_frame, encode_job, encode_preamble, encode_trailer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    AwaitingPreamble,
    AwaitingJobs,
    Ended,
}

impl LogState {
    fn expected(self) -> &'static str {
        match self {
            Self::AwaitingPreamble => "preamble",
            Self::AwaitingJobs => "job or trailer",
            Self::Ended => "end of log",
        }
    }
}

/// Single-writer case log sink. Not synchronised; only the coordinator writes.
pub struct CaseWriter<W: Write> {
    sink: W,
    state: LogState,
    running: RunningDigest,
    jobs_written: usize,
}

impl<W: Write> CaseWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            state: LogState::AwaitingPreamble,
            running: RunningDigest::new(),
            jobs_written: 0,
        }
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn jobs_written(&self) -> usize {
        self.jobs_written
    }

    /// Write the preamble. Returns `Ok(false)` if it was already written.
    pub fn write_preamble(&mut self, case: &SurfaceAgnosticCase) -> Result<bool> {
        if self.state != LogState::AwaitingPreamble {
            debug!(state = ?self.state, "ignoring preamble write out of sequence");
            return Ok(false);
        }
        let frame = encode_preamble(case).context("encode case preamble")?;
        self.emit(&frame.bytes)?;
        self.running.update(&frame.digest);
        self.state = LogState::AwaitingJobs;
        Ok(true)
    }

    /// Append a job. Returns `Ok(false)` before the preamble or after the trailer.
    pub fn write_job(&mut self, job: &SurfaceAgnosticJob) -> Result<bool> {
        if self.state != LogState::AwaitingJobs {
            debug!(state = ?self.state, "ignoring job write out of sequence");
            return Ok(false);
        }
        let frame = encode_job(job).context("encode case job")?;
        self.emit(&frame.bytes)?;
        self.running.update(&frame.digest);
        self.jobs_written += 1;
        Ok(true)
    }

    /// Write the trailer. Idempotent: only the first call after the preamble writes.
    pub fn finish(&mut self) -> Result<bool> {
        if self.state != LogState::AwaitingJobs {
            debug!(state = ?self.state, "ignoring trailer write out of sequence");
            return Ok(false);
        }
        let bytes = encode_trailer(&self.running.current());
        self.emit(&bytes)?;
        self.state = LogState::Ended;
        Ok(true)
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes).context("write case record")?;
        self.sink.flush().context("flush case record")
    }
}

/// Create (truncating) a case log file, creating parent directories.
pub fn create_case_file(path: &Path) -> Result<CaseWriter<BufWriter<File>>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create case dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create case log {}", path.display()))?;
    Ok(CaseWriter::new(BufWriter::new(file)))
}

/// Streaming, verifying reader over an in-memory case log.
///
/// Yields frames in order and stops after the first error.
pub struct CaseReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    state: LogState,
    running: RunningDigest,
    done: bool,
}

impl<'a> CaseReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            state: LogState::AwaitingPreamble,
            running: RunningDigest::new(),
            done: false,
        }
    }

    fn fail(&mut self, err: CaseCodecError) -> Option<Result<Frame, CaseCodecError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for CaseReader<'_> {
    type Item = Result<Frame, CaseCodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.offset >= self.bytes.len() {
            self.done = true;
            if self.state == LogState::Ended {
                return None;
            }
            return Some(Err(CaseCodecError::MissingTrailer));
        }
        if self.state == LogState::Ended {
            let count = self.bytes.len() - self.offset;
            let offset = self.offset;
            return self.fail(CaseCodecError::TrailingBytes { offset, count });
        }

        let (frame, next) = match decode_frame(self.bytes, self.offset) {
            Ok(decoded) => decoded,
            Err(err) => return self.fail(err),
        };

        let accepted = matches!(
            (self.state, &frame),
            (LogState::AwaitingPreamble, Frame::Preamble { .. })
                | (LogState::AwaitingJobs, Frame::Job { .. } | Frame::Trailer { .. })
        );
        if !accepted {
            let err = CaseCodecError::OutOfOrder {
                offset: self.offset,
                found: frame.label(),
                expected: self.state.expected(),
            };
            return self.fail(err);
        }

        match &frame {
            Frame::Preamble { digest, .. } => {
                self.running.update(digest);
                self.state = LogState::AwaitingJobs;
            }
            Frame::Job { digest, .. } => self.running.update(digest),
            Frame::Trailer { running } => {
                let computed = self.running.current();
                if computed != *running {
                    return self.fail(CaseCodecError::TrailerMismatch {
                        expected: hex::encode(running),
                        actual: hex::encode(computed),
                    });
                }
                self.state = LogState::Ended;
            }
        }
        self.offset = next;
        Some(Ok(frame))
    }
}

/// A fully verified case log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseLog {
    pub case: SurfaceAgnosticCase,
    pub jobs: Vec<SurfaceAgnosticJob>,
    pub trailer_digest: CaseDigest,
}

/// Everything decoded before the first fault, plus the fault itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReadout {
    pub case: Option<SurfaceAgnosticCase>,
    pub jobs: Vec<SurfaceAgnosticJob>,
    pub trailer_digest: Option<CaseDigest>,
    pub error: Option<CaseCodecError>,
}

impl CaseReadout {
    pub fn trailer_verified(&self) -> bool {
        self.trailer_digest.is_some() && self.error.is_none()
    }

    pub fn into_verified(self) -> Result<CaseLog, CaseCodecError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match (self.case, self.trailer_digest) {
            (Some(case), Some(trailer_digest)) => Ok(CaseLog {
                case,
                jobs: self.jobs,
                trailer_digest,
            }),
            _ => Err(CaseCodecError::MissingTrailer),
        }
    }
}

pub fn read_case(bytes: &[u8]) -> CaseReadout {
    let mut readout = CaseReadout {
        case: None,
        jobs: Vec::new(),
        trailer_digest: None,
        error: None,
    };
    for frame in CaseReader::new(bytes) {
        match frame {
            Ok(Frame::Preamble { case, .. }) => readout.case = Some(case),
            Ok(Frame::Job { job, .. }) => readout.jobs.push(job),
            Ok(Frame::Trailer { running }) => readout.trailer_digest = Some(running),
            Err(err) => readout.error = Some(err),
        }
    }
    readout
}

pub fn read_case_strict(bytes: &[u8]) -> Result<CaseLog, CaseCodecError> {
    read_case(bytes).into_verified()
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_case_file(path: &Path) -> Result<CaseReadout> {
    let bytes = fs::read(path).with_context(|| format!("read case log {}", path.display()))?;
    let readout = read_case(&bytes);
    debug!(
        jobs = readout.jobs.len(),
        verified = readout.trailer_verified(),
        "case log read"
    );
    Ok(readout)
}
