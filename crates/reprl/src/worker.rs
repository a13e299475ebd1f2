//! The per-worker façade tying a child supervisor to its coverage state.
//!
//! A [`Worker`] is one independent execution pipeline. Workers are handed
//! out by the [`WorkerPool`] registry and may be moved to dedicated threads;
//! the core takes no locks, so each worker id must be driven by at most one
//! thread at a time.

use std::{ffi::OsString, time::Duration};

use tracing::debug;

use crate::{
    coverage::{CoverageError, CoverageMap},
    execution::{Execution, MAX_DATA_SIZE, ReprlError, ReprlOptions, ReprlSession},
    target::{ConfigError, TargetConfig},
};

/// Capacity of the default worker registry.
pub const MAX_WORKERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker id {0} is outside the registry (capacity {1})")]
    IdOutOfRange(usize, usize),
    #[error("worker {0} is already initialized")]
    AlreadyInitialized(usize),
    #[error("worker {0} is not initialized")]
    NotInitialized(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reprl(#[from] ReprlError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

/// One execution pipeline: a REPRL session plus its coverage map.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    session: ReprlSession,
    coverage: CoverageMap,
    track_edges: bool,
}

impl Worker {
    /// Sets up the worker: coverage shared memory first (the child needs its
    /// name via `SHM_ID`), then the session with its data channels. The
    /// child environment is the parent's plus `SHM_ID`, built exactly once.
    pub fn new(id: usize, config: &TargetConfig) -> Result<Self, WorkerError> {
        let coverage = CoverageMap::new(id)?;
        let mut envs: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        envs.push(("SHM_ID".into(), coverage.shm_id().into()));

        let session = ReprlSession::new(ReprlOptions {
            worker_id: id,
            argv: config.argv(),
            envs,
            capture_stdout: config.capture_stdout,
            capture_stderr: config.capture_stderr,
            debug_output: config.debug_output,
        })?;
        debug!(worker = id, engine = ?config.engine, "Worker initialized");

        Ok(Self {
            id,
            session,
            coverage,
            track_edges: config.track_edges,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Starts a child without executing anything.
    pub fn spawn(&mut self) -> Result<(), WorkerError> {
        self.session.spawn()?;
        Ok(())
    }

    /// Runs one script in the persistent child, spawning or replacing the
    /// child as needed. Timeouts and child deaths are encoded in the
    /// returned status; errors are protocol or system failures.
    pub fn execute(
        &mut self,
        script: &[u8],
        timeout: Duration,
        fresh_instance: bool,
    ) -> Result<Execution, WorkerError> {
        if script.len() > MAX_DATA_SIZE {
            return Err(ReprlError::ScriptTooLarge(script.len()).into());
        }
        if fresh_instance {
            self.session.terminate();
        }
        self.session.reset_channels()?;
        if !self.session.is_running() {
            self.session.spawn()?;
        }
        self.session.stage_script(script)?;
        // The target clears its own bitmap on `cexe`; clearing here as well
        // keeps a misbehaving target from replaying stale coverage.
        self.coverage.clear_bitmap();
        let execution = self.session.dispatch(script.len() as u64, timeout)?;

        // The first completed execution proves the target has written its
        // edge count, so the coverage map can be sized.
        if !self.coverage.is_finalized() {
            self.coverage.finish_initialization(self.track_edges)?;
        }
        Ok(execution)
    }

    /// Diffs the last execution's coverage against the virgin map; returns
    /// the newly discovered edge indices.
    pub fn evaluate(&mut self) -> Vec<u32> {
        self.coverage.evaluate()
    }

    pub fn fetch_stdout(&mut self) -> Result<&[u8], WorkerError> {
        Ok(self.session.fetch_stdout()?)
    }

    pub fn fetch_stderr(&mut self) -> Result<&[u8], WorkerError> {
        Ok(self.session.fetch_stderr()?)
    }

    pub fn fetch_fuzzout(&mut self) -> Result<&[u8], WorkerError> {
        Ok(self.session.fetch_fuzzout()?)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.session.last_error()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.session.child_pid()
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    pub fn coverage_mut(&mut self) -> &mut CoverageMap {
        &mut self.coverage
    }
}

/// Registry of workers indexed by id.
///
/// This is the only shared structure in the crate and it is deliberately
/// lock-free: callers either drive workers through `get_mut` from a single
/// thread, or `take` them out and hand each to its own thread.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<Worker>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_WORKERS);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Creates and registers the worker for `id`.
    pub fn init_worker(
        &mut self,
        id: usize,
        config: &TargetConfig,
    ) -> Result<&mut Worker, WorkerError> {
        let capacity = self.slots.len();
        let slot = self
            .slots
            .get_mut(id)
            .ok_or(WorkerError::IdOutOfRange(id, capacity))?;
        if slot.is_some() {
            return Err(WorkerError::AlreadyInitialized(id));
        }
        Ok(slot.insert(Worker::new(id, config)?))
    }

    pub fn get(&self, id: usize) -> Option<&Worker> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Worker> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Removes the worker from the registry, e.g. to move it to its own
    /// thread.
    pub fn take(&mut self, id: usize) -> Option<Worker> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    /// Tears the worker down: kills its child, unmaps its channels and
    /// unlinks its shared memory.
    pub fn destroy(&mut self, id: usize) -> Result<(), WorkerError> {
        self.take(id)
            .map(drop)
            .ok_or(WorkerError::NotInitialized(id))
    }
}
