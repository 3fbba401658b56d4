//! Test-only helpers: scripted transformers, temp trees and recording collaborators.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::protocol::{CoordinatorMessage, SlotId, WorkerEnvelope};
use crate::core::types::{EngineHint, MutationCommand};
use crate::io::apply::Applier;
use crate::io::transformer::{TransformInput, Transformer, TransformerFactory};
use crate::io::worker::{ThreadSpawner, WorkerHandle, WorkerSpawner};
use crate::scheduler::PoolConfig;

/// How long a [`Script::Hang`] transformer blocks.
pub const HANG_FOR: Duration = Duration::from_secs(3);

/// Scripted behavior for files with a given name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Report this body.
    Change(&'static str),
    /// Report nothing.
    NoChange,
    /// Return an error with this message.
    Fail(&'static str),
    Panic,
    /// Block for [`HANG_FOR`], then report nothing.
    Hang,
}

/// Factory whose transformers follow a per-file-name script.
///
/// Files without a script are left unchanged.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    scripts: Arc<BTreeMap<String, Script>>,
    loads: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, file_name: &str, script: Script) -> Self {
        Arc::make_mut(&mut self.scripts).insert(file_name.to_string(), script);
        self
    }

    /// Number of transformers handed out so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl TransformerFactory for ScriptedFactory {
    fn load(&self, _engine: EngineHint) -> Result<Box<dyn Transformer>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedTransformer {
            scripts: Arc::clone(&self.scripts),
        }))
    }
}

struct ScriptedTransformer {
    scripts: Arc<BTreeMap<String, Script>>,
}

impl Transformer for ScriptedTransformer {
    fn transform(&mut self, input: &TransformInput<'_>) -> Result<Option<String>> {
        let name = input
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.scripts.get(&name).copied().unwrap_or(Script::NoChange) {
            Script::Change(body) => Ok(Some(body.to_string())),
            Script::NoChange => Ok(None),
            Script::Fail(message) => Err(anyhow!("{message}")),
            Script::Panic => panic!("scripted panic for {name}"),
            Script::Hang => {
                thread::sleep(HANG_FOR);
                Ok(None)
            }
        }
    }
}

/// Thread spawner that fails every spawn once its budget is used up.
pub struct LimitedSpawner {
    inner: ThreadSpawner,
    remaining: usize,
}

impl LimitedSpawner {
    pub fn new(factory: Arc<dyn TransformerFactory>, spawns: usize) -> Self {
        Self {
            inner: ThreadSpawner::new(factory, 256 * 1024),
            remaining: spawns,
        }
    }
}

impl WorkerSpawner for LimitedSpawner {
    fn spawn(
        &mut self,
        slot: SlotId,
        generation: u64,
        events: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        if self.remaining == 0 {
            return Err(anyhow!("spawn budget exhausted for slot {slot}"));
        }
        self.remaining -= 1;
        self.inner.spawn(slot, generation, events)
    }
}

/// Thread spawner whose first `refusals` workers reject every dispatch.
pub struct RefusingSpawner {
    inner: ThreadSpawner,
    refusals: usize,
}

impl RefusingSpawner {
    pub fn new(factory: Arc<dyn TransformerFactory>, refusals: usize) -> Self {
        Self {
            inner: ThreadSpawner::new(factory, 256 * 1024),
            refusals,
        }
    }
}

impl WorkerSpawner for RefusingSpawner {
    fn spawn(
        &mut self,
        slot: SlotId,
        generation: u64,
        events: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let worker = self.inner.spawn(slot, generation, events)?;
        if self.refusals == 0 {
            return Ok(worker);
        }
        self.refusals -= 1;
        Ok(Box::new(RefusingWorker { inner: worker }))
    }
}

struct RefusingWorker {
    inner: Box<dyn WorkerHandle>,
}

impl WorkerHandle for RefusingWorker {
    fn send(&mut self, _message: CoordinatorMessage) -> Result<()> {
        Err(anyhow!("broken pipe"))
    }

    fn terminate(self: Box<Self>) {
        self.inner.terminate();
    }

    fn shutdown(self: Box<Self>) {
        self.inner.shutdown();
    }
}

/// Thread spawner for tests, with a small stack.
pub fn thread_spawner(factory: ScriptedFactory) -> ThreadSpawner {
    ThreadSpawner::new(Arc::new(factory), 256 * 1024)
}

/// Pool settings with short timings so hang tests finish quickly.
pub fn quick_pool(slots: usize) -> PoolConfig {
    PoolConfig {
        slots,
        hang_threshold: Duration::from_millis(300),
        tick: Duration::from_millis(25),
    }
}

/// A temporary directory populated with files.
pub struct TestTree {
    dir: TempDir,
}

impl TestTree {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = Self { dir };
        for (name, content) in files {
            tree.write(name, content);
        }
        tree
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &str) {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write file");
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path(name)).expect("read file")
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }
}

/// Applier that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    pub applied: Vec<MutationCommand>,
}

impl Applier for RecordingApplier {
    fn apply(&mut self, command: &MutationCommand) -> Result<()> {
        self.applied.push(command.clone());
        Ok(())
    }
}
