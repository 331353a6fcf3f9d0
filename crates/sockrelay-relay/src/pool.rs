use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use sockrelay_frame::{encode_result, FrameKind, JobResult, WorkPacket};
use sockrelay_transport::Connection;
use tracing::{debug, error, warn};

use crate::error::{RelayError, Result};
use crate::processor::Processor;

/// A decoded packet waiting for a worker, with the connection to answer on.
#[derive(Debug)]
pub struct Job {
    pub connection: Arc<Connection>,
    pub packet: WorkPacket,
    /// Op-code the request arrived with; the result goes back with the same one.
    pub kind: FrameKind,
}

/// Fixed set of worker threads fed through a bounded queue.
pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads sharing a queue of `capacity` pending jobs.
    pub fn spawn(workers: usize, capacity: usize, processor: Arc<dyn Processor>) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let processor = Arc::clone(&processor);
            let handle = thread::Builder::new()
                .name(format!("sockrelay-worker-{index}"))
                .spawn(move || worker_loop(&receiver, processor.as_ref()))
                .map_err(|source| RelayError::Thread {
                    name: "worker",
                    source,
                })?;
            handles.push(handle);
        }
        debug!(workers = handles.len(), capacity, "worker pool started");

        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Queue a job. Blocks while the queue is full.
    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(RelayError::PoolClosed)?;
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!(
                    conn_id = job.connection.id(),
                    "worker queue full, dispatch blocked"
                );
                sender.send(job).map_err(|_| RelayError::PoolClosed)
            }
            Err(TrySendError::Disconnected(_)) => Err(RelayError::PoolClosed),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs, let workers finish the queue, and join them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("open", &self.sender.is_some())
            .finish()
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>, processor: &dyn Processor) {
    loop {
        let job = {
            let guard = receiver
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };
        match job {
            Ok(job) => answer(job, processor),
            Err(_) => return,
        }
    }
}

/// Run the processor for one packet and build its result.
pub fn run_job(processor: &dyn Processor, packet: &WorkPacket) -> JobResult {
    let source = Path::new(&packet.source_path);
    match processor.process(source) {
        Ok(output) => JobResult::success(packet.clone(), output.to_string_lossy()),
        Err(err) => {
            warn!(source = %packet.source_path, error = %err, "processing failed");
            let expected = processor.output_path(source);
            JobResult::failure(packet.clone(), expected.to_string_lossy(), err.to_string())
        }
    }
}

fn answer(job: Job, processor: &dyn Processor) {
    let result = run_job(processor, &job.packet);
    let conn_id = job.connection.id();

    let message = match encode_result(&result, job.kind).and_then(|frame| frame.into_message()) {
        Ok(message) => message,
        Err(err) => {
            error!(conn_id, error = %err, "failed to encode result");
            return;
        }
    };
    // Write failures leave the connection registered; the next read on it
    // observes the breakage and deregisters it.
    if let Err(err) = job.connection.send(message) {
        warn!(conn_id, error = %err, "failed to write result");
        return;
    }
    debug!(conn_id, source = %result.packet.source_path, outcome = ?result.outcome(), "result written");
}
