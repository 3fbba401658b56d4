//! Messages exchanged between the coordinator and its workers.
//!
//! Both directions are plain serde values so that in-process channels and
//! process workers (JSON lines over stdin/stdout) share one vocabulary.
//!
//! Per slot the exchange is strictly request/response: a slot receives one
//! `Dispatch`, answers with at most one `Result` or `Error`, and then always
//! acknowledges with `Idleness` before it is dispatched again.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::{ArgumentRecord, EngineHint, MutationCommand};

/// Stable identity of a pool position.
pub type SlotId = usize;

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Dispatch {
        path: PathBuf,
        engine: EngineHint,
        arguments: ArgumentRecord,
    },
    Exit,
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Result {
        path: PathBuf,
        commands: Vec<MutationCommand>,
    },
    /// Ready for more work; concludes the current job.
    Idleness,
    Error { path: PathBuf, message: String },
}

/// A worker message tagged with its sender's slot and generation.
///
/// The generation changes whenever a slot's worker is replaced, so messages
/// from a replaced worker can be told apart and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnvelope {
    pub slot: SlotId,
    pub generation: u64,
    pub message: WorkerMessage,
}
