//! Shared deterministic types for the runner core.
//!
//! These types define stable contracts between the coordinator, the workers and
//! the audit trail. They do not depend on external state or I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Options handed to every transformation, keyed by argument name.
///
/// A `BTreeMap` keeps the JSON encoding stable, which matters because the
/// record is hashed into the case preamble.
pub type ArgumentRecord = BTreeMap<String, serde_json::Value>;

/// Parse a `key=value` CLI argument into an [`ArgumentRecord`] entry.
///
/// The value is read as JSON when it parses (`n=3`, `flag=true`), otherwise
/// it is kept as a plain string.
pub fn parse_argument_pair(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("argument {raw:?} must look like key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("argument {raw:?} has an empty key"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Which transformation engine a job should be executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHint {
    /// MiniJinja transformation evaluated inside the sandbox.
    Template,
    /// External program: body on stdin, new body on stdout.
    Command,
}

impl EngineHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for EngineHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineHint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "template" => Ok(Self::Template),
            "command" => Ok(Self::Command),
            other => Err(anyhow!("unknown engine {other:?} (expected template|command)")),
        }
    }
}

/// One file-path transformation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub path: PathBuf,
    pub engine: EngineHint,
    pub arguments: ArgumentRecord,
}

/// A file mutation produced by a worker. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationCommand {
    CreateFile { path: PathBuf, data: String },
    UpdateFile {
        path: PathBuf,
        old_data: String,
        new_data: String,
    },
    DeleteFile { path: PathBuf },
    MoveFile { from: PathBuf, to: PathBuf },
    CopyFile { from: PathBuf, to: PathBuf },
}

impl MutationCommand {
    /// The path this command primarily concerns (source path for moves/copies).
    pub fn primary_path(&self) -> &PathBuf {
        match self {
            Self::CreateFile { path, .. }
            | Self::UpdateFile { path, .. }
            | Self::DeleteFile { path } => path,
            Self::MoveFile { from, .. } | Self::CopyFile { from, .. } => from,
        }
    }
}

/// Aggregate progress of a run. `processed` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub processed: usize,
    pub total: usize,
}

impl ProgressReport {
    pub const fn new(processed: usize, total: usize) -> Self {
        Self { processed, total }
    }
}
