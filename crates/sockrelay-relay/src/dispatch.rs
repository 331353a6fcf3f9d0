use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sockrelay_frame::{decode_packet, Frame};
use sockrelay_mux::Multiplexer;
use sockrelay_transport::Connection;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::pool::{Job, WorkerPool};
use crate::processor::Processor;

/// Default upper bound on a single readiness wait, so shutdown is observed.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// Default pending-job capacity of the worker queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Dispatch loop configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Worker threads running the processor.
    pub workers: usize,
    /// Jobs that may wait for a worker before dispatch blocks.
    pub queue_capacity: usize,
    /// Longest single readiness wait.
    pub wait_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// What draining one ready connection produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Packets handed to the worker pool.
    pub dispatched: usize,
    /// Frames that did not decode as work packets.
    pub rejected: usize,
    /// The connection failed and was deregistered.
    pub removed: bool,
}

/// The single-threaded readiness loop of the consumer.
pub struct DispatchLoop {
    mux: Arc<Multiplexer>,
    pool: WorkerPool,
    running: Arc<AtomicBool>,
    wait_timeout: Duration,
}

impl DispatchLoop {
    /// Build the loop and start its worker pool.
    pub fn new(
        mux: Arc<Multiplexer>,
        processor: Arc<dyn Processor>,
        config: DispatchConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let pool = WorkerPool::spawn(config.workers, config.queue_capacity, processor)?;
        Ok(Self {
            mux,
            pool,
            running,
            wait_timeout: config.wait_timeout,
        })
    }

    /// Run until the shutdown flag clears or the multiplexer fails fatally.
    ///
    /// Workers finish their queued jobs before this returns.
    pub fn run(self) -> Result<()> {
        info!(workers = self.pool.workers(), "dispatch loop started");
        let outcome = self.run_until_stopped();
        self.pool.shutdown();
        info!("dispatch loop stopped");
        outcome
    }

    fn run_until_stopped(&self) -> Result<()> {
        while self.running.load(Ordering::Acquire) {
            match self.mux.wait(Some(self.wait_timeout)) {
                Ok(ready) => self.dispatch(&ready)?,
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "readiness wait failed, stopping dispatch");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(error = %err, "readiness wait failed");
                }
            }
        }
        Ok(())
    }

    /// Drain every connection of one ready batch, in batch order.
    pub fn dispatch(&self, ready: &[Arc<Connection>]) -> Result<()> {
        for conn in ready {
            self.drain(conn)?;
        }
        Ok(())
    }

    /// Read `conn` until it would block, dispatching each decoded packet.
    ///
    /// Only a closed worker pool is an error; per-connection failures are
    /// handled here.
    pub fn drain(&self, conn: &Arc<Connection>) -> Result<DrainOutcome> {
        let mut outcome = DrainOutcome::default();
        loop {
            let message = match conn.read_message() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(outcome),
                Err(err) => {
                    debug!(conn_id = conn.id(), fd = conn.fd(), error = %err, "read failed, dropping connection");
                    if let Err(err) = self.mux.remove(conn) {
                        warn!(conn_id = conn.id(), error = %err, "deregistration failed");
                    }
                    conn.close();
                    outcome.removed = true;
                    return Ok(outcome);
                }
            };

            let decoded = Frame::from_message(message)
                .and_then(|frame| decode_packet(&frame).map(|packet| (frame.kind, packet)));
            let (kind, packet) = match decoded {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(conn_id = conn.id(), error = %err, "discarding undecodable frame");
                    outcome.rejected += 1;
                    continue;
                }
            };

            self.pool.submit(Job {
                connection: Arc::clone(conn),
                packet,
                kind,
            })?;
            outcome.dispatched += 1;
        }
    }

    /// Flag observed by `run`; clearing it stops the loop.
    pub fn running(&self) -> &Arc<AtomicBool> {
        &self.running
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }
}

impl std::fmt::Debug for DispatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLoop")
            .field("mux", &self.mux)
            .field("pool", &self.pool)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use sockrelay_frame::{decode_result, FrameKind, Outcome, WorkPacket};
    use sockrelay_transport::Message;

    use super::*;
    use crate::error::ProcessingError;
    use crate::processor::default_output_path;
    use crate::testing::connection_pair;

    fn dispatch_loop(mux: &Arc<Multiplexer>) -> DispatchLoop {
        let stub = |source: &Path| -> std::result::Result<PathBuf, ProcessingError> {
            Ok(default_output_path(source))
        };
        DispatchLoop::new(
            Arc::clone(mux),
            Arc::new(stub),
            DispatchConfig {
                workers: 2,
                queue_capacity: 8,
                wait_timeout: Duration::from_millis(50),
            },
            Arc::new(AtomicBool::new(true)),
        )
        .expect("dispatch loop should start")
    }

    fn wait_ready(mux: &Multiplexer) -> Vec<Arc<Connection>> {
        for _ in 0..40 {
            let ready = mux
                .wait(Some(Duration::from_millis(50)))
                .expect("wait should succeed");
            if !ready.is_empty() {
                return ready;
            }
        }
        panic!("no connection became ready");
    }

    #[test]
    fn packet_is_answered_on_same_connection() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let (server, peer) = connection_pair();
        mux.add(Arc::clone(&server)).expect("add should succeed");

        peer.send(Message::Text(r#"{"Filepath":"/tmp/7.mov"}"#.into()))
            .expect("send should succeed");
        let ready = wait_ready(&mux);
        let outcome = dispatcher.drain(&ready[0]).expect("drain should succeed");
        assert_eq!(outcome.dispatched, 1);

        let message = peer
            .read_message()
            .expect("read should succeed")
            .expect("result should arrive");
        let frame = Frame::from_message(message).expect("data frame");
        assert_eq!(frame.kind, FrameKind::Text);
        let result = decode_result(&frame).expect("result should decode");
        assert_eq!(result.outcome(), Outcome::Success);
        assert_eq!(result.packet, WorkPacket::new("/tmp/7.mov"));
        assert_eq!(result.converted, "/tmp/7.mov.mp4");
    }

    #[test]
    fn drain_reads_every_buffered_frame() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let (server, peer) = connection_pair();
        mux.add(Arc::clone(&server)).expect("add should succeed");

        for i in 0..5 {
            peer.send(Message::Text(format!(r#"{{"Filepath":"/tmp/{i}.mov"}}"#)))
                .expect("send should succeed");
        }
        thread::sleep(Duration::from_millis(50));
        let ready = wait_ready(&mux);
        let outcome = dispatcher.drain(&ready[0]).expect("drain should succeed");
        assert_eq!(outcome.dispatched, 5);
    }

    #[test]
    fn malformed_frame_keeps_connection_and_writes_nothing() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let (bad, bad_peer) = connection_pair();
        let (good, good_peer) = connection_pair();
        mux.add(Arc::clone(&bad)).expect("add should succeed");
        mux.add(Arc::clone(&good)).expect("add should succeed");

        bad_peer
            .send(Message::Text("{not json".into()))
            .expect("send should succeed");
        good_peer
            .send(Message::Text(r#"{"Filepath":"/tmp/ok.mov"}"#.into()))
            .expect("send should succeed");
        thread::sleep(Duration::from_millis(50));

        let ready = wait_ready(&mux);
        dispatcher.dispatch(&ready).expect("dispatch should succeed");
        if ready.len() < 2 {
            let ready = wait_ready(&mux);
            dispatcher.dispatch(&ready).expect("dispatch should succeed");
        }

        assert_eq!(mux.len(), 2);
        assert!(mux.registry().contains(bad.fd()));
        assert!(good_peer
            .read_message()
            .expect("read should succeed")
            .is_some());

        bad_peer
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("timeout should apply");
        assert!(bad_peer
            .read_message()
            .expect("read should time out cleanly")
            .is_none());
    }

    #[test]
    fn read_failure_deregisters_and_closes() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let (server, peer) = connection_pair();
        mux.add(Arc::clone(&server)).expect("add should succeed");

        drop(peer);
        let ready = wait_ready(&mux);
        let outcome = dispatcher.drain(&ready[0]).expect("drain should succeed");

        assert!(outcome.removed);
        assert!(mux.is_empty());
        assert!(!server.is_open());
    }

    #[test]
    fn failing_connection_does_not_hide_others() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let (dead, dead_peer) = connection_pair();
        let (live, live_peer) = connection_pair();
        mux.add(Arc::clone(&dead)).expect("add should succeed");
        mux.add(Arc::clone(&live)).expect("add should succeed");

        drop(dead_peer);
        live_peer
            .send(Message::Text(r#"{"Filepath":"/tmp/live.mov"}"#.into()))
            .expect("send should succeed");
        thread::sleep(Duration::from_millis(50));

        let mut answered = false;
        for _ in 0..10 {
            let ready = mux
                .wait(Some(Duration::from_millis(50)))
                .expect("wait should succeed");
            dispatcher.dispatch(&ready).expect("dispatch should succeed");
            if ready.iter().any(|conn| conn.id() == live.id()) {
                answered = true;
                break;
            }
        }
        assert!(answered);
        assert!(live_peer
            .read_message()
            .expect("read should succeed")
            .is_some());
    }

    #[test]
    fn stalled_result_reader_does_not_delay_other_connections() {
        // Results for /tmp/slow/* are far larger than the socket buffers.
        let processor = |source: &Path| -> std::result::Result<PathBuf, ProcessingError> {
            if source.starts_with("/tmp/slow") {
                return Ok(PathBuf::from(format!("/tmp/{}", "x".repeat(16 * 1024 * 1024))));
            }
            Ok(default_output_path(source))
        };
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = DispatchLoop::new(
            Arc::clone(&mux),
            Arc::new(processor),
            DispatchConfig {
                workers: 3,
                queue_capacity: 8,
                wait_timeout: Duration::from_millis(50),
            },
            Arc::new(AtomicBool::new(true)),
        )
        .expect("dispatch loop should start");
        let (slow, slow_peer) = connection_pair();
        let (healthy, healthy_peer) = connection_pair();
        mux.add(Arc::clone(&slow)).expect("add should succeed");
        mux.add(Arc::clone(&healthy)).expect("add should succeed");

        slow_peer
            .send(Message::Text(r#"{"Filepath":"/tmp/slow/1.mov"}"#.into()))
            .expect("send should succeed");
        let ready = wait_ready(&mux);
        dispatcher.dispatch(&ready).expect("dispatch should succeed");
        thread::sleep(Duration::from_millis(300));

        slow_peer
            .send(Message::Text(r#"{"Filepath":"/tmp/slow/2.mov"}"#.into()))
            .expect("send should succeed");
        healthy_peer
            .send(Message::Text(r#"{"Filepath":"/tmp/ok.mov"}"#.into()))
            .expect("send should succeed");
        thread::sleep(Duration::from_millis(50));

        let mut healthy_dispatched = false;
        for _ in 0..10 {
            let ready = wait_ready(&mux);
            let started = std::time::Instant::now();
            dispatcher.dispatch(&ready).expect("dispatch should succeed");
            let elapsed = started.elapsed();
            assert!(elapsed < Duration::from_millis(500), "dispatch took {elapsed:?}");
            if ready.iter().any(|conn| conn.id() == healthy.id()) {
                healthy_dispatched = true;
                break;
            }
        }
        assert!(healthy_dispatched);

        let message = healthy_peer
            .read_message()
            .expect("read should succeed")
            .expect("result should arrive");
        let frame = Frame::from_message(message).expect("data frame");
        let result = decode_result(&frame).expect("result should decode");
        assert_eq!(result.converted, "/tmp/ok.mov.mp4");

        drop(slow_peer);
    }

    #[test]
    fn run_stops_when_flag_clears() {
        let mux = Arc::new(Multiplexer::new().expect("epoll should be available"));
        let dispatcher = dispatch_loop(&mux);
        let running = Arc::clone(dispatcher.running());

        let handle = thread::spawn(move || dispatcher.run());
        thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::Release);

        handle
            .join()
            .expect("dispatch thread should not panic")
            .expect("dispatch should stop cleanly");
    }
}
