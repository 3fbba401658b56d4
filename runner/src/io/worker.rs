//! Worker side of the pool.
//!
//! [`serve_jobs`] is the loop every worker runs, whatever hosts it. The
//! coordinator reaches workers through [`WorkerSpawner`] and [`WorkerHandle`]:
//! [`ThreadSpawner`] hosts each slot on a dedicated OS thread, and
//! [`ProcessSpawner`] re-executes the runner binary as `codemod-runner worker`
//! and speaks JSON lines over the child's stdin/stdout.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::protocol::{CoordinatorMessage, SlotId, WorkerEnvelope, WorkerMessage};
use crate::core::types::{ArgumentRecord, EngineHint, MutationCommand};
use crate::io::transformer::{TransformInput, Transformer, TransformerFactory};

/// Run jobs from `inbox` until `Exit` or until the inbox closes.
///
/// Every `Dispatch` is answered with at most one `Result` or `Error`, then
/// `Idleness`. Transformer failures and panics become `Error` messages; only a
/// failing `outbox` (the coordinator is gone) ends the loop with an error.
pub fn serve_jobs<I, O>(factory: &dyn TransformerFactory, inbox: I, mut outbox: O) -> Result<()>
where
    I: IntoIterator<Item = CoordinatorMessage>,
    O: FnMut(WorkerMessage) -> Result<()>,
{
    let mut loaded: BTreeMap<EngineHint, Box<dyn Transformer>> = BTreeMap::new();

    for message in inbox {
        let (path, engine, arguments) = match message {
            CoordinatorMessage::Dispatch {
                path,
                engine,
                arguments,
            } => (path, engine, arguments),
            CoordinatorMessage::Exit => {
                debug!("worker received exit");
                return Ok(());
            }
        };

        match run_job(factory, &mut loaded, &path, engine, &arguments) {
            Ok(commands) if commands.is_empty() => {}
            Ok(commands) => outbox(WorkerMessage::Result {
                path: path.clone(),
                commands,
            })?,
            Err(err) => {
                debug!(path = %path.display(), err = %format!("{err:#}"), "job failed");
                outbox(WorkerMessage::Error {
                    path: path.clone(),
                    message: format!("{err:#}"),
                })?;
            }
        }
        outbox(WorkerMessage::Idleness)?;
    }

    debug!("worker inbox closed");
    Ok(())
}

fn run_job(
    factory: &dyn TransformerFactory,
    loaded: &mut BTreeMap<EngineHint, Box<dyn Transformer>>,
    path: &Path,
    engine: EngineHint,
    arguments: &ArgumentRecord,
) -> Result<Vec<MutationCommand>> {
    let transformer = match loaded.entry(engine) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(
            factory
                .load(engine)
                .with_context(|| format!("load {engine} engine"))?,
        ),
    };

    let content =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let input = TransformInput {
        path,
        content: &content,
        options: arguments,
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| transformer.transform(&input)));
    let new_body = match outcome {
        Ok(result) => result?,
        Err(payload) => {
            // A transformer that panicked may hold broken state; reload it next time.
            loaded.remove(&engine);
            return Err(anyhow!("transformer panicked: {}", panic_message(payload.as_ref())));
        }
    };

    Ok(match new_body {
        Some(new_data) if new_data != content => vec![MutationCommand::UpdateFile {
            path: path.to_path_buf(),
            old_data: content,
            new_data,
        }],
        _ => Vec::new(),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Coordinator-side handle to one running worker.
pub trait WorkerHandle {
    fn send(&mut self, message: CoordinatorMessage) -> Result<()>;

    /// Forcefully stop a worker that stopped responding.
    fn terminate(self: Box<Self>);

    /// Ask the worker to exit and wait for it.
    fn shutdown(self: Box<Self>);
}

/// Starts workers for pool slots. Every message a worker produces goes to
/// `events`, tagged with the slot and generation it was spawned for.
pub trait WorkerSpawner {
    fn spawn(
        &mut self,
        slot: SlotId,
        generation: u64,
        events: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

/// Hosts each worker on its own OS thread.
pub struct ThreadSpawner {
    factory: Arc<dyn TransformerFactory>,
    stack_bytes: usize,
}

impl ThreadSpawner {
    pub fn new(factory: Arc<dyn TransformerFactory>, stack_bytes: usize) -> Self {
        Self {
            factory,
            stack_bytes,
        }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &mut self,
        slot: SlotId,
        generation: u64,
        events: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let (inbox, jobs) = mpsc::channel::<CoordinatorMessage>();
        let factory = Arc::clone(&self.factory);
        let thread = thread::Builder::new()
            .name(format!("codemod-worker-{slot}.{generation}"))
            .stack_size(self.stack_bytes)
            .spawn(move || {
                let outbox = |message: WorkerMessage| {
                    events
                        .send(WorkerEnvelope {
                            slot,
                            generation,
                            message,
                        })
                        .map_err(|_| anyhow!("coordinator hung up"))
                };
                if let Err(err) = serve_jobs(factory.as_ref(), jobs, outbox) {
                    debug!(slot, generation, err = %err, "worker thread stopped");
                }
            })
            .with_context(|| format!("spawn worker thread for slot {slot}"))?;
        debug!(slot, generation, "worker thread started");
        Ok(Box::new(ThreadWorker {
            inbox,
            thread: Some(thread),
        }))
    }
}

struct ThreadWorker {
    inbox: Sender<CoordinatorMessage>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorker {
    fn send(&mut self, message: CoordinatorMessage) -> Result<()> {
        self.inbox
            .send(message)
            .map_err(|_| anyhow!("worker thread is gone"))
    }

    fn terminate(self: Box<Self>) {
        // Threads cannot be killed. Closing the inbox and detaching is enough:
        // the thread's generation is stale, so whatever it sends is dropped.
        debug!("detaching hung worker thread");
    }

    fn shutdown(mut self: Box<Self>) {
        let _ = self.inbox.send(CoordinatorMessage::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

/// Hosts each worker in a child process speaking JSON lines.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    exit_grace: Duration,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            program,
            args,
            exit_grace: Duration::from_secs(5),
        }
    }

    /// Re-execute the running binary with `args` (which should select worker mode).
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(program, args))
    }
}

impl WorkerSpawner for ProcessSpawner {
    #[instrument(skip(self, events), fields(program = %self.program.display()))]
    fn spawn(
        &mut self,
        slot: SlotId,
        generation: u64,
        events: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn worker process {}", self.program.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not piped"))?;

        let pending: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let in_flight = Arc::clone(&pending);
        let reader = thread::Builder::new()
            .name(format!("codemod-worker-reader-{slot}.{generation}"))
            .spawn(move || {
                let send = |message: WorkerMessage| {
                    events
                        .send(WorkerEnvelope {
                            slot,
                            generation,
                            message,
                        })
                        .is_ok()
                };
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(slot, generation, err = %err, "unparseable worker output");
                            continue;
                        }
                    };
                    if message == WorkerMessage::Idleness {
                        set_in_flight(&in_flight, None);
                    }
                    if !send(message) {
                        return;
                    }
                }
                // The process is gone. Conclude the job it died on.
                if let Some(path) = set_in_flight(&in_flight, None) {
                    warn!(slot, generation, path = %path.display(), "worker process died mid-job");
                    let died = WorkerMessage::Error {
                        path,
                        message: "worker process exited while handling the job".to_string(),
                    };
                    if send(died) {
                        send(WorkerMessage::Idleness);
                    }
                }
            })
            .context("spawn worker reader thread")?;

        debug!(slot, generation, pid = child.id(), "worker process started");
        Ok(Box::new(ProcessWorker {
            child,
            stdin: Some(stdin),
            reader: Some(reader),
            pending,
            exit_grace: self.exit_grace,
        }))
    }
}

struct ProcessWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    /// Path of the job the child is working on, shared with the reader.
    pending: Arc<Mutex<Option<PathBuf>>>,
    exit_grace: Duration,
}

/// Replace the in-flight path, returning the previous one.
fn set_in_flight(pending: &Mutex<Option<PathBuf>>, path: Option<PathBuf>) -> Option<PathBuf> {
    match pending.lock() {
        Ok(mut slot) => std::mem::replace(&mut *slot, path),
        Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), path),
    }
}

impl WorkerHandle for ProcessWorker {
    fn send(&mut self, message: CoordinatorMessage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("worker stdin already closed"))?;
        let mut line = serde_json::to_string(&message).context("serialize worker message")?;
        line.push('\n');
        if let CoordinatorMessage::Dispatch { path, .. } = &message {
            set_in_flight(&self.pending, Some(path.clone()));
        }
        let written = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush());
        if let Err(err) = written {
            set_in_flight(&self.pending, None);
            return Err(err).context("write to worker process");
        }
        Ok(())
    }

    fn terminate(mut self: Box<Self>) {
        set_in_flight(&self.pending, None);
        self.stdin.take();
        if let Err(err) = self.child.kill() {
            warn!(err = %err, "failed to kill worker process");
        }
        let _ = self.child.wait();
        // The reader sees EOF once the child is gone.
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn shutdown(mut self: Box<Self>) {
        let _ = self.send(CoordinatorMessage::Exit);
        self.stdin.take();
        match self.child.wait_timeout(self.exit_grace) {
            Ok(Some(status)) => debug!(exit_code = ?status.code(), "worker process exited"),
            Ok(None) | Err(_) => {
                warn!("worker process ignored exit, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Arguments selecting worker mode on the runner binary.
pub fn worker_mode_args(config: &Path, transform: Option<&Path>) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("worker"),
        OsString::from("--config"),
        config.as_os_str().to_os_string(),
    ];
    if let Some(transform) = transform {
        args.push(OsString::from("--transform"));
        args.push(transform.as_os_str().to_os_string());
    }
    args
}

/// Cap this process's address space at `bytes`, keeping the hard limit.
///
/// Called by worker processes before serving jobs. An allocation past the
/// cap aborts the worker; the coordinator then reports its job as failed.
#[cfg(unix)]
pub fn limit_address_space(bytes: u64) -> Result<()> {
    use rlimit::Resource;

    let (_, hard) = Resource::AS.get().context("read address space limit")?;
    let soft = bytes.min(hard);
    Resource::AS
        .set(soft, hard)
        .with_context(|| format!("limit address space to {soft} bytes"))?;
    debug!(soft, hard, "address space limited");
    Ok(())
}

#[cfg(not(unix))]
pub fn limit_address_space(bytes: u64) -> Result<()> {
    warn!(bytes, "address space limits are not supported on this platform");
    Ok(())
}

/// Worker-mode entry point: serve jobs over this process's stdin/stdout.
pub fn serve_stdio(factory: &dyn TransformerFactory) -> Result<()> {
    info!("worker process ready");
    let stdin = std::io::stdin();
    let inbox = stdin
        .lock()
        .lines()
        .map_while(|line| line.ok())
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<CoordinatorMessage>(&line) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(err = %err, "ignoring unparseable coordinator message");
                None
            }
        });

    let stdout = std::io::stdout();
    let outbox = |message: WorkerMessage| -> Result<()> {
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &message).context("serialize worker message")?;
        out.write_all(b"\n").context("write worker message")?;
        out.flush().context("flush worker message")
    };

    serve_jobs(factory, inbox, outbox)
}
