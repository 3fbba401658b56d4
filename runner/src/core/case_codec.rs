//! Byte layout of the surface-agnostic case log.
//!
//! A case log is a sequence of self-describing frames:
//!
//! ```text
//! preamble  "INTC" | version[4] | len:u16be | digest[20] | payload[len]
//! job       "INTJ" | len:u16be  | digest[20] | payload[len]
//! trailer   "INTE" | running digest[20]
//! ```
//!
//! Preamble payload: case digest[20] | codemod digest[20] | created_at:i64be |
//! str target path | str argument record JSON. Job payload: job digest[20] |
//! kind:u8 | str old uri | str new uri. Every `str` is a u16be length followed
//! by UTF-8 bytes.
//!
//! Each frame digest is RIPEMD-160 over that frame's payload only. The trailer
//! carries RIPEMD-160 over every frame digest in write order, so a reader can
//! detect dropped, reordered or corrupted frames in a single streaming pass.
//!
//! This module is a pure transform between typed records and bytes. Sequencing
//! rules live in [`crate::io::case_log`].

use ripemd::{Digest, Ripemd160};
use serde::Serialize;
use thiserror::Error;

use crate::core::types::ArgumentRecord;

pub const DIGEST_LEN: usize = 20;
pub type CaseDigest = [u8; DIGEST_LEN];

pub const PREAMBLE_MAGIC: [u8; 4] = *b"INTC";
pub const JOB_MAGIC: [u8; 4] = *b"INTJ";
pub const TRAILER_MAGIC: [u8; 4] = *b"INTE";
pub const FORMAT_VERSION: [u8; 4] = [1, 0, 0, 0];

/// Largest payload (and largest length-prefixed field) a frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFE;

/// Run preamble; written exactly once, first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceAgnosticCase {
    #[serde(with = "hex::serde")]
    pub case_hash_digest: CaseDigest,
    #[serde(with = "hex::serde")]
    pub codemod_hash_digest: CaseDigest,
    pub created_at: i64,
    pub absolute_target_path: String,
    pub argument_record: ArgumentRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobKind {
    RewriteFile = 1,
    CreateFile = 2,
    DeleteFile = 3,
    MoveFile = 4,
    MoveAndRewriteFile = 5,
    CopyFile = 6,
}

impl JobKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::RewriteFile),
            2 => Some(Self::CreateFile),
            3 => Some(Self::DeleteFile),
            4 => Some(Self::MoveFile),
            5 => Some(Self::MoveAndRewriteFile),
            6 => Some(Self::CopyFile),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One applied mutation in the case log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceAgnosticJob {
    #[serde(with = "hex::serde")]
    pub job_hash_digest: CaseDigest,
    pub kind: JobKind,
    pub old_uri: String,
    pub new_uri: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaseCodecError {
    #[error("truncated frame at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic {found:?} at offset {offset}")]
    BadMagic { offset: usize, found: [u8; 4] },

    #[error("unsupported case format version {version:?}")]
    UnsupportedVersion { version: [u8; 4] },

    #[error("{what} is {len} bytes, limit is 65534")]
    TooLarge { what: &'static str, len: usize },

    #[error("digest mismatch at offset {offset}: expected {expected}, computed {actual}")]
    DigestMismatch {
        offset: usize,
        expected: String,
        actual: String,
    },

    #[error("malformed {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },

    #[error("unknown job kind {0}")]
    UnknownJobKind(u8),

    #[error("unexpected {found} record at offset {offset} (expected {expected})")]
    OutOfOrder {
        offset: usize,
        found: &'static str,
        expected: &'static str,
    },

    #[error("trailer digest mismatch: expected {expected}, computed {actual}")]
    TrailerMismatch { expected: String, actual: String },

    #[error("case log ended without a trailer")]
    MissingTrailer,

    #[error("{count} unexpected bytes after trailer at offset {offset}")]
    TrailingBytes { offset: usize, count: usize },
}

pub fn ripemd160(bytes: &[u8]) -> CaseDigest {
    finalize(Ripemd160::new_with_prefix(bytes))
}

fn finalize(hasher: Ripemd160) -> CaseDigest {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Hash-of-hashes accumulated over every frame digest in write order.
#[derive(Clone, Default)]
pub struct RunningDigest {
    hasher: Ripemd160,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, record_digest: &CaseDigest) {
        self.hasher.update(record_digest);
    }

    /// Current value without consuming the accumulator.
    pub fn current(&self) -> CaseDigest {
        finalize(self.hasher.clone())
    }
}

/// An encoded frame plus the digest the running digest must absorb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub digest: CaseDigest,
}

pub fn encode_preamble(case: &SurfaceAgnosticCase) -> Result<EncodedFrame, CaseCodecError> {
    let arguments = serde_json::to_string(&case.argument_record).map_err(|err| {
        CaseCodecError::MalformedField {
            field: "argument record",
            reason: err.to_string(),
        }
    })?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&case.case_hash_digest);
    payload.extend_from_slice(&case.codemod_hash_digest);
    payload.extend_from_slice(&case.created_at.to_be_bytes());
    push_str(&mut payload, "target path", &case.absolute_target_path)?;
    push_str(&mut payload, "argument record", &arguments)?;

    let digest = ripemd160(&payload);
    let mut bytes = Vec::with_capacity(4 + 4 + 2 + DIGEST_LEN + payload.len());
    bytes.extend_from_slice(&PREAMBLE_MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION);
    bytes.extend_from_slice(&payload_len(&payload)?.to_be_bytes());
    bytes.extend_from_slice(&digest);
    bytes.extend_from_slice(&payload);
    Ok(EncodedFrame { bytes, digest })
}

pub fn encode_job(job: &SurfaceAgnosticJob) -> Result<EncodedFrame, CaseCodecError> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&job.job_hash_digest);
    payload.push(job.kind.as_byte());
    push_str(&mut payload, "old uri", &job.old_uri)?;
    push_str(&mut payload, "new uri", &job.new_uri)?;

    let digest = ripemd160(&payload);
    let mut bytes = Vec::with_capacity(4 + 2 + DIGEST_LEN + payload.len());
    bytes.extend_from_slice(&JOB_MAGIC);
    bytes.extend_from_slice(&payload_len(&payload)?.to_be_bytes());
    bytes.extend_from_slice(&digest);
    bytes.extend_from_slice(&payload);
    Ok(EncodedFrame { bytes, digest })
}

pub fn encode_trailer(running: &CaseDigest) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + DIGEST_LEN);
    bytes.extend_from_slice(&TRAILER_MAGIC);
    bytes.extend_from_slice(running);
    bytes
}

fn payload_len(payload: &[u8]) -> Result<u16, CaseCodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CaseCodecError::TooLarge {
            what: "payload",
            len: payload.len(),
        });
    }
    Ok(payload.len() as u16)
}

fn push_str(out: &mut Vec<u8>, what: &'static str, value: &str) -> Result<(), CaseCodecError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(CaseCodecError::TooLarge {
            what,
            len: bytes.len(),
        });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// A verified frame. `digest` is the frame digest (absent for the trailer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Preamble {
        case: SurfaceAgnosticCase,
        digest: CaseDigest,
    },
    Job {
        job: SurfaceAgnosticJob,
        digest: CaseDigest,
    },
    Trailer { running: CaseDigest },
}

impl Frame {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Preamble { .. } => "preamble",
            Self::Job { .. } => "job",
            Self::Trailer { .. } => "trailer",
        }
    }
}

/// Decode and verify the frame starting at `offset`.
///
/// Returns the frame and the offset just past it. Magic, version, length and
/// payload digest are all checked before anything is returned.
pub fn decode_frame(bytes: &[u8], offset: usize) -> Result<(Frame, usize), CaseCodecError> {
    let mut cursor = Cursor::new(bytes, offset);
    let magic: [u8; 4] = cursor.array()?;
    match magic {
        PREAMBLE_MAGIC => {
            let version: [u8; 4] = cursor.array()?;
            if version != FORMAT_VERSION {
                return Err(CaseCodecError::UnsupportedVersion { version });
            }
            let (payload, digest) = cursor.verified_payload()?;
            let case = decode_preamble_payload(payload, cursor.payload_offset)?;
            Ok((Frame::Preamble { case, digest }, cursor.pos))
        }
        JOB_MAGIC => {
            let (payload, digest) = cursor.verified_payload()?;
            let job = decode_job_payload(payload, cursor.payload_offset)?;
            Ok((Frame::Job { job, digest }, cursor.pos))
        }
        TRAILER_MAGIC => {
            let running: CaseDigest = cursor.array()?;
            Ok((Frame::Trailer { running }, cursor.pos))
        }
        found => Err(CaseCodecError::BadMagic { offset, found }),
    }
}

fn decode_preamble_payload(
    payload: &[u8],
    offset: usize,
) -> Result<SurfaceAgnosticCase, CaseCodecError> {
    let mut cursor = Cursor::new(payload, 0).with_base(offset);
    let case_hash_digest = cursor.array()?;
    let codemod_hash_digest = cursor.array()?;
    let created_at = i64::from_be_bytes(cursor.array()?);
    let absolute_target_path = cursor.string("target path")?;
    let arguments = cursor.string("argument record")?;
    cursor.expect_end("preamble payload")?;

    let argument_record: ArgumentRecord =
        serde_json::from_str(&arguments).map_err(|err| CaseCodecError::MalformedField {
            field: "argument record",
            reason: err.to_string(),
        })?;

    Ok(SurfaceAgnosticCase {
        case_hash_digest,
        codemod_hash_digest,
        created_at,
        absolute_target_path,
        argument_record,
    })
}

fn decode_job_payload(payload: &[u8], offset: usize) -> Result<SurfaceAgnosticJob, CaseCodecError> {
    let mut cursor = Cursor::new(payload, 0).with_base(offset);
    let job_hash_digest = cursor.array()?;
    let [kind_byte] = cursor.array::<1>()?;
    let kind = JobKind::from_byte(kind_byte).ok_or(CaseCodecError::UnknownJobKind(kind_byte))?;
    let old_uri = cursor.string("old uri")?;
    let new_uri = cursor.string("new uri")?;
    cursor.expect_end("job payload")?;
    Ok(SurfaceAgnosticJob {
        job_hash_digest,
        kind,
        old_uri,
        new_uri,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Added to `pos` in error offsets when decoding a payload sub-slice.
    base: usize,
    payload_offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self {
            bytes,
            pos,
            base: 0,
            payload_offset: 0,
        }
    }

    fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CaseCodecError> {
        let available = self.bytes.len().saturating_sub(self.pos);
        if available < len {
            return Err(CaseCodecError::Truncated {
                offset: self.base + self.pos,
                needed: len - available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CaseCodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, CaseCodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CaseCodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|err| CaseCodecError::MalformedField {
            field,
            reason: err.to_string(),
        })
    }

    /// Read `len | digest | payload` and check the digest against the payload.
    fn verified_payload(&mut self) -> Result<(&'a [u8], CaseDigest), CaseCodecError> {
        let len = self.u16()? as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(CaseCodecError::TooLarge {
                what: "payload",
                len,
            });
        }
        let expected: CaseDigest = self.array()?;
        self.payload_offset = self.base + self.pos;
        let payload = self.take(len)?;
        let actual = ripemd160(payload);
        if actual != expected {
            return Err(CaseCodecError::DigestMismatch {
                offset: self.payload_offset,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok((payload, expected))
    }

    fn expect_end(&self, field: &'static str) -> Result<(), CaseCodecError> {
        if self.pos != self.bytes.len() {
            return Err(CaseCodecError::MalformedField {
                field,
                reason: format!("{} unread bytes", self.bytes.len() - self.pos),
            });
        }
        Ok(())
    }
}
