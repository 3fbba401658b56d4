//! Worker pool scheduler.
//!
//! Owns one worker per slot plus the [`PoolState`] bookkeeping, and runs on
//! the coordinator thread only: workers report through a single fan-in
//! channel, and all queue and slot mutation happens here.
//!
//! A slot whose worker stays silent past the hang threshold is terminated and
//! replaced under a new generation. Its in-flight path is abandoned, not
//! retried. A dispatch the worker never accepted is different: the path goes
//! back to the front of the queue and the worker is restarted.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::pool::{Dispatch, PoolState};
use crate::core::protocol::{CoordinatorMessage, SlotId, WorkerEnvelope, WorkerMessage};
use crate::core::types::{ArgumentRecord, EngineHint, MutationCommand, ProgressReport};
use crate::io::config::RunConfig;
use crate::io::worker::{WorkerHandle, WorkerSpawner};

/// Consecutive refused dispatches after which a slot is retired.
const MAX_SEND_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub slots: usize,
    pub hang_threshold: Duration,
    /// Interval between hang scans; also the longest the coordinator blocks.
    pub tick: Duration,
}

impl PoolConfig {
    pub fn from_run_config(cfg: &RunConfig) -> Self {
        Self {
            slots: cfg.pool_size,
            hang_threshold: Duration::from_millis(cfg.hang_threshold_ms),
            tick: Duration::from_millis(cfg.tick_interval_ms),
        }
    }
}

/// What the scheduler tells its caller while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Commands {
        slot: SlotId,
        path: PathBuf,
        commands: Vec<MutationCommand>,
    },
    JobError {
        slot: SlotId,
        path: PathBuf,
        message: String,
    },
    /// Emitted after every idleness acknowledgement.
    Progress(ProgressReport),
    /// The slot's worker was replaced and `path` abandoned.
    Hang { slot: SlotId, path: PathBuf },
    Finished(PoolSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub progress: ProgressReport,
    pub abandoned: Vec<PathBuf>,
    pub replaced_workers: usize,
    pub job_errors: usize,
}

pub struct PoolScheduler<S: WorkerSpawner> {
    spawner: S,
    config: PoolConfig,
    engine: EngineHint,
    arguments: ArgumentRecord,
    state: PoolState,
    workers: Vec<Option<Box<dyn WorkerHandle>>>,
    events_tx: Sender<WorkerEnvelope>,
    events: Receiver<WorkerEnvelope>,
    send_failures: Vec<u32>,
    replaced_workers: usize,
    job_errors: usize,
}

impl<S: WorkerSpawner> PoolScheduler<S> {
    /// Spawn one worker per slot. Any spawn failure here is fatal.
    #[instrument(skip_all, fields(slots = config.slots, paths = paths.len()))]
    pub fn start(
        mut spawner: S,
        config: PoolConfig,
        engine: EngineHint,
        arguments: ArgumentRecord,
        paths: Vec<PathBuf>,
    ) -> Result<Self> {
        if config.slots == 0 {
            bail!("worker pool needs at least one slot");
        }
        let (events_tx, events) = mpsc::channel();
        let mut workers: Vec<Option<Box<dyn WorkerHandle>>> = Vec::with_capacity(config.slots);
        for slot in 0..config.slots {
            match spawner.spawn(slot, 0, events_tx.clone()) {
                Ok(worker) => workers.push(Some(worker)),
                Err(err) => {
                    for worker in workers.into_iter().flatten() {
                        worker.terminate();
                    }
                    return Err(err.context(format!("start worker pool (slot {slot})")));
                }
            }
        }
        info!("worker pool started");

        Ok(Self {
            spawner,
            config,
            engine,
            arguments,
            state: PoolState::new(config.slots, paths),
            workers,
            events_tx,
            events,
            send_failures: vec![0; config.slots],
            replaced_workers: 0,
            job_errors: 0,
        })
    }

    /// Drive the pool until every path is concluded or abandoned.
    ///
    /// Always ends with [`PoolEvent::Finished`], after every live worker has
    /// been told to exit.
    #[instrument(skip_all, fields(total = self.state.progress().total))]
    pub fn run<F: FnMut(PoolEvent)>(mut self, mut on_event: F) -> PoolSummary {
        let mut next_scan = Instant::now() + self.config.tick;

        loop {
            self.dispatch();
            if self.state.is_finished() {
                break;
            }
            if self.state.live_count() == 0 {
                let dropped = self.state.abandon_queue();
                error!(count = dropped.len(), "no live workers left, abandoning queued paths");
                continue;
            }

            let wait = next_scan.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(wait) {
                Ok(envelope) => self.handle(envelope, &mut on_event),
                // The scheduler holds a sender itself, so this is always a timeout.
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
            }

            let now = Instant::now();
            if now >= next_scan {
                self.scan_hangs(now, &mut on_event);
                next_scan = now + self.config.tick;
            }
        }

        for worker in self.workers.iter_mut().filter_map(Option::take) {
            worker.shutdown();
        }
        let summary = PoolSummary {
            progress: self.state.progress(),
            abandoned: self.state.abandoned().to_vec(),
            replaced_workers: self.replaced_workers,
            job_errors: self.job_errors,
        };
        info!(
            processed = summary.progress.processed,
            abandoned = summary.abandoned.len(),
            replaced = summary.replaced_workers,
            errors = summary.job_errors,
            "worker pool finished"
        );
        on_event(PoolEvent::Finished(summary.clone()));
        summary
    }

    fn dispatch(&mut self) {
        loop {
            let batch = self.state.next_dispatches(Instant::now());
            if batch.is_empty() {
                return;
            }
            for dispatch in batch {
                self.send_dispatch(dispatch);
            }
        }
    }

    /// Hand one bound path to its worker. A worker that cannot take it is
    /// restarted and the path goes back to the front of the queue.
    fn send_dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch { slot, path, .. } = dispatch;
        let message = CoordinatorMessage::Dispatch {
            path: path.clone(),
            engine: self.engine,
            arguments: self.arguments.clone(),
        };
        let sent = match self.workers[slot].as_mut() {
            Some(worker) => worker.send(message),
            None => Err(anyhow!("slot has no worker")),
        };
        match sent {
            Ok(()) => {
                self.send_failures[slot] = 0;
                debug!(slot, path = %path.display(), "dispatched");
            }
            Err(err) => {
                self.send_failures[slot] += 1;
                warn!(
                    slot,
                    path = %path.display(),
                    err = %format!("{err:#}"),
                    "dispatch failed, requeueing"
                );
                self.state.requeue(slot);
                if self.send_failures[slot] < MAX_SEND_FAILURES {
                    self.restart(slot);
                } else {
                    error!(
                        slot,
                        failures = self.send_failures[slot],
                        "worker keeps refusing jobs, retiring slot"
                    );
                    if let Some(worker) = self.workers[slot].take() {
                        worker.terminate();
                    }
                }
            }
        }
    }

    fn handle(&mut self, envelope: WorkerEnvelope, on_event: &mut impl FnMut(PoolEvent)) {
        let WorkerEnvelope {
            slot,
            generation,
            message,
        } = envelope;
        if !self.state.is_current(slot, generation) {
            debug!(slot, generation, "dropping message from replaced worker");
            return;
        }

        match message {
            WorkerMessage::Result { path, commands } => {
                if self.state.touch(slot, generation, Instant::now()) {
                    on_event(PoolEvent::Commands {
                        slot,
                        path,
                        commands,
                    });
                } else {
                    debug!(slot, "dropping result from idle slot");
                }
            }
            WorkerMessage::Error { path, message } => {
                if self.state.touch(slot, generation, Instant::now()) {
                    self.job_errors += 1;
                    on_event(PoolEvent::JobError {
                        slot,
                        path,
                        message,
                    });
                } else {
                    debug!(slot, "dropping error from idle slot");
                }
            }
            WorkerMessage::Idleness => {
                if self.state.release(slot, generation).is_some() {
                    on_event(PoolEvent::Progress(self.state.progress()));
                }
            }
        }
    }

    fn scan_hangs(&mut self, now: Instant, on_event: &mut impl FnMut(PoolEvent)) {
        for slot in self.state.hung_slots(now, self.config.hang_threshold) {
            self.replace(slot, on_event);
        }
    }

    /// Kill the worker on a busy slot, abandon its path and start a new worker.
    fn replace(&mut self, slot: SlotId, on_event: &mut impl FnMut(PoolEvent)) {
        let Some(path) = self.state.abandon(slot) else {
            return;
        };
        warn!(slot, path = %path.display(), "worker unresponsive, replacing");
        if let Some(worker) = self.workers[slot].take() {
            worker.terminate();
        }
        on_event(PoolEvent::Hang { slot, path });
        self.restart(slot);
    }

    /// Start a new worker on a dead slot, or retire the slot if that fails.
    fn restart(&mut self, slot: SlotId) {
        if let Some(worker) = self.workers[slot].take() {
            worker.terminate();
        }
        let Some(generation) = self.state.revive(slot) else {
            return;
        };
        match self.spawner.spawn(slot, generation, self.events_tx.clone()) {
            Ok(worker) => {
                self.workers[slot] = Some(worker);
                self.replaced_workers += 1;
                info!(slot, generation, "worker replaced");
            }
            Err(err) => {
                error!(slot, err = %format!("{err:#}"), "replacement worker failed to start");
                self.state.retire(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        LimitedSpawner, RefusingSpawner, Script, ScriptedFactory, TestTree, quick_pool,
        thread_spawner,
    };
    use std::sync::Arc;

    /// Allowance for thread scheduling on a loaded machine.
    const JITTER: Duration = Duration::from_millis(150);

    fn run(
        spawner: impl WorkerSpawner,
        slots: usize,
        paths: Vec<PathBuf>,
    ) -> (PoolSummary, Vec<PoolEvent>) {
        let scheduler = PoolScheduler::start(
            spawner,
            quick_pool(slots),
            EngineHint::Template,
            ArgumentRecord::new(),
            paths,
        )
        .expect("start");
        let mut events = Vec::new();
        let summary = scheduler.run(|event| events.push(event));
        (summary, events)
    }

    fn hung_paths(events: &[PoolEvent]) -> Vec<PathBuf> {
        events
            .iter()
            .filter_map(|e| match e {
                PoolEvent::Hang { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_total() {
        let names = ["1", "2", "3", "4", "5", "6", "7"];
        let files: Vec<(&str, &str)> = names.iter().map(|n| (*n, "x")).collect();
        let tree = TestTree::new(&files);
        let paths = names.iter().map(|n| tree.path(n)).collect();

        let (summary, events) = run(thread_spawner(ScriptedFactory::new()), 3, paths);

        let processed: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                PoolEvent::Progress(p) => Some(p.processed),
                _ => None,
            })
            .collect();
        assert_eq!(processed, (1..=7).collect::<Vec<_>>());
        assert_eq!(summary.progress, ProgressReport::new(7, 7));
        assert!(matches!(events.last(), Some(PoolEvent::Finished(_))));
    }

    #[test]
    fn empty_path_list_finishes_immediately() {
        let (summary, events) = run(thread_spawner(ScriptedFactory::new()), 2, Vec::new());
        assert_eq!(summary.progress, ProgressReport::new(0, 0));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn initial_spawn_failure_is_fatal() {
        let factory = Arc::new(ScriptedFactory::new());
        let result = PoolScheduler::start(
            LimitedSpawner::new(factory, 1),
            quick_pool(2),
            EngineHint::Template,
            ArgumentRecord::new(),
            Vec::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn failed_replacement_retires_slot_and_run_still_finishes() {
        let tree = TestTree::new(&[("hang.txt", "x"), ("a.txt", "x"), ("b.txt", "x")]);
        let factory = Arc::new(
            ScriptedFactory::new()
                .on("hang.txt", Script::Hang)
                .on("a.txt", Script::Change("y")),
        );
        let paths = vec![tree.path("hang.txt"), tree.path("a.txt"), tree.path("b.txt")];

        // Two initial workers, no budget for a replacement.
        let (summary, events) = run(LimitedSpawner::new(factory, 2), 2, paths);

        assert_eq!(summary.abandoned, vec![tree.path("hang.txt")]);
        assert_eq!(summary.replaced_workers, 0);
        assert_eq!(summary.progress, ProgressReport::new(2, 3));
        assert_eq!(hung_paths(&events), vec![tree.path("hang.txt")]);
    }

    #[test]
    fn hang_is_reported_within_one_tick_of_the_threshold() {
        let tree = TestTree::new(&[("hang.txt", "x")]);
        let factory = ScriptedFactory::new().on("hang.txt", Script::Hang);
        let pool = quick_pool(1);
        let scheduler = PoolScheduler::start(
            thread_spawner(factory),
            pool,
            EngineHint::Template,
            ArgumentRecord::new(),
            vec![tree.path("hang.txt")],
        )
        .expect("start");

        let started = Instant::now();
        let mut hang_at = None;
        scheduler.run(|event| {
            if matches!(event, PoolEvent::Hang { .. }) {
                hang_at.get_or_insert_with(Instant::now);
            }
        });

        let elapsed = hang_at.expect("hang event").duration_since(started);
        assert!(elapsed > pool.hang_threshold, "reported early: {elapsed:?}");
        assert!(
            elapsed <= pool.hang_threshold + pool.tick + JITTER,
            "reported late: {elapsed:?}"
        );
    }

    #[test]
    fn refused_dispatch_is_requeued_on_a_fresh_worker() {
        let tree = TestTree::new(&[("a.txt", "x"), ("b.txt", "x")]);
        let factory = Arc::new(ScriptedFactory::new().on("a.txt", Script::Change("y")));
        let paths = vec![tree.path("a.txt"), tree.path("b.txt")];

        let (summary, events) = run(RefusingSpawner::new(factory, 1), 1, paths);

        assert!(summary.abandoned.is_empty());
        assert_eq!(summary.replaced_workers, 1);
        assert_eq!(summary.progress, ProgressReport::new(2, 2));
        assert!(hung_paths(&events).is_empty());
        let changed: Vec<&PathBuf> = events
            .iter()
            .filter_map(|e| match e {
                PoolEvent::Commands { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![&tree.path("a.txt")]);
    }

    #[test]
    fn slot_that_keeps_refusing_is_retired() {
        let tree = TestTree::new(&[("a.txt", "x"), ("b.txt", "x")]);
        let factory = Arc::new(ScriptedFactory::new());
        let paths = vec![tree.path("a.txt"), tree.path("b.txt")];

        let (summary, events) = run(RefusingSpawner::new(factory, usize::MAX), 1, paths.clone());

        assert_eq!(summary.abandoned, paths);
        assert_eq!(summary.progress, ProgressReport::new(0, 2));
        assert!(hung_paths(&events).is_empty());
        assert!(matches!(events.last(), Some(PoolEvent::Finished(_))));
    }
}
