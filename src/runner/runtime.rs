//! Worker runtime for simulation runs.
//!
//! A bounded job queue feeds named worker threads. Each job is one full
//! run; the calculation lock inside the shared stage cache keeps runs from
//! overlapping, so extra workers only queue behind it. Results come back
//! over a one-shot reply channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{RuntimeError, StemError, StemResult};
use crate::meta::SimulationMetadata;
use crate::pipeline::OverwriteConfirm;

use super::{RunSummary, Simulation};

enum Job {
    Run {
        meta: Box<SimulationMetadata>,
        confirm: Box<dyn OverwriteConfirm>,
        reply: Sender<StemResult<RunSummary>>,
    },
}

struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, simulation: &Arc<Simulation>) -> Result<Self, RuntimeError> {
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let simulation = Arc::clone(simulation);
            let name = format!("stemflow-run-{idx}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(Job::Run { meta, confirm, reply }) = rx.recv() {
                        let result = simulation.run(*meta, confirm.as_ref());
                        let _ = reply.send(result);
                    }
                })
                .map_err(|e| RuntimeError::Spawn {
                    name,
                    reason: e.to_string(),
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
            queue_capacity,
        })
    }

    fn try_submit(&self, job: Job) -> Result<(), RuntimeError> {
        let tx = self.tx.as_ref().ok_or(RuntimeError::Disconnected)?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::Disconnected),
        }
    }

    fn shutdown(&mut self) {
        // Closing the channel lets workers drain queued jobs and exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Handle to a queued run.
#[derive(Debug)]
pub struct RunHandle {
    rx: Receiver<StemResult<RunSummary>>,
}

impl RunHandle {
    /// Waits for the run to finish.
    ///
    /// # Errors
    /// Returns the run's error, or `RuntimeError::Disconnected` if the worker
    /// went away without replying.
    pub fn join(self) -> StemResult<RunSummary> {
        self.rx
            .recv()
            .map_err(|_| StemError::from(RuntimeError::Disconnected))?
    }

    /// Waits up to `timeout` for the run to finish.
    ///
    /// Returns `Ok(None)` on timeout; the run keeps going.
    ///
    /// # Errors
    /// See [`RunHandle::join`].
    pub fn join_timeout(&self, timeout: Duration) -> StemResult<Option<RunSummary>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RuntimeError::Disconnected.into()),
        }
    }
}

/// Background runtime executing runs on worker threads.
pub struct SimulationRuntime {
    simulation: Arc<Simulation>,
    pool: WorkerPool,
}

impl std::fmt::Debug for SimulationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRuntime")
            .field("workers", &self.pool.workers.len())
            .field("queue_capacity", &self.pool.queue_capacity)
            .finish()
    }
}

impl SimulationRuntime {
    /// Starts `config.workers` worker threads.
    ///
    /// # Errors
    /// Returns a validation error for a zero-sized config and
    /// `RuntimeError::Spawn` if a thread cannot be started.
    pub fn start(simulation: Arc<Simulation>, config: PipelineConfig) -> StemResult<Self> {
        let config = config.validate()?;
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &simulation)?;
        debug!(workers = config.workers, "simulation runtime started");
        Ok(Self { simulation, pool })
    }

    /// Queues a run without blocking.
    ///
    /// # Errors
    /// Returns `RuntimeError::QueueFull` if the queue is at capacity.
    pub fn submit(
        &self,
        meta: SimulationMetadata,
        confirm: impl OverwriteConfirm + 'static,
    ) -> Result<RunHandle, RuntimeError> {
        let (reply, rx) = bounded(1);
        self.pool.try_submit(Job::Run {
            meta: Box::new(meta),
            confirm: Box::new(confirm),
            reply,
        })?;
        Ok(RunHandle { rx })
    }

    /// Queues a run and waits for it.
    ///
    /// # Errors
    /// See [`SimulationRuntime::submit`] and [`RunHandle::join`].
    pub fn run(&self, meta: SimulationMetadata, confirm: impl OverwriteConfirm + 'static) -> StemResult<RunSummary> {
        self.submit(meta, confirm)?.join()
    }

    /// The shared runner.
    #[must_use]
    pub fn simulation(&self) -> &Arc<Simulation> {
        &self.simulation
    }
}

impl Drop for SimulationRuntime {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_reports_disconnected_when_reply_dropped() {
        let (tx, rx) = bounded::<StemResult<RunSummary>>(1);
        drop(tx);
        let handle = RunHandle { rx };
        let err = handle.join().unwrap_err();
        assert!(matches!(err, StemError::Runtime(RuntimeError::Disconnected)));
    }

    #[test]
    fn test_join_timeout_returns_none_while_pending() {
        let (_tx, rx) = bounded::<StemResult<RunSummary>>(1);
        let handle = RunHandle { rx };
        assert!(handle.join_timeout(Duration::from_millis(5)).unwrap().is_none());
    }
}
