use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sockrelay_frame::{decode_result, encode_packet, Frame, FrameKind, WorkPacket};
use sockrelay_transport::{dial, Connection, Message, TransportError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LinkError, Result};
use crate::fanout::{ResultEvent, ResultFanout};

/// Default consumer endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "ws://127.0.0.1:3000/websocket";

/// Default number of packets buffered while the link is busy or down.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// `ws://` URL of the consumer's upgrade endpoint.
    pub url: String,
    /// Bound on one dial (connect + handshake) and on every write.
    pub dial_timeout: Duration,
    /// Outbound packets that may wait before `enqueue` rejects.
    pub queue_capacity: usize,
    /// Write the packet that hit a broken link again after a successful redial.
    pub retry_failed_packet: bool,
    /// How often blocked loops re-check for shutdown.
    pub poll_interval: Duration,
    /// Longest the receiver waits for a redial before re-checking.
    pub reconnect_wait: Duration,
    /// Events a result subscriber may fall behind.
    pub fanout_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            dial_timeout: Duration::from_secs(5),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_failed_packet: false,
            poll_interval: Duration::from_millis(100),
            reconnect_wait: Duration::from_secs(1),
            fanout_capacity: crate::fanout::DEFAULT_FANOUT_CAPACITY,
        }
    }
}

impl LinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Health of the active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Connected = 0,
    /// A failure was observed and no redial has succeeded since.
    Reconnecting = 1,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            _ => Self::Reconnecting,
        }
    }
}

struct Slot {
    conn: Arc<Connection>,
    generation: u64,
}

/// State shared by the sender thread, the receiver thread, and the handle.
struct Shared {
    config: LinkConfig,
    slot: Mutex<Slot>,
    changed: Condvar,
    state: AtomicU8,
    redials: AtomicU64,
    dial_lock: Mutex<()>,
    running: AtomicBool,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> (Arc<Connection>, u64) {
        let slot = self.slot();
        (Arc::clone(&slot.conn), slot.generation)
    }

    fn generation(&self) -> u64 {
        self.slot().generation
    }

    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Record that `generation` is dead and close it so the next write fails fast.
    fn mark_broken(&self, generation: u64) {
        let conn = {
            let slot = self.slot();
            if slot.generation != generation {
                return;
            }
            Arc::clone(&slot.conn)
        };
        self.set_state(LinkState::Reconnecting);
        conn.close();
    }

    /// One redial attempt, unless another already replaced `observed`.
    fn redial(&self, observed: u64) -> Result<()> {
        let _dialing = self
            .dial_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.generation() != observed {
            return Ok(());
        }

        self.redials.fetch_add(1, Ordering::AcqRel);
        self.set_state(LinkState::Reconnecting);
        let conn = dial(&self.config.url, self.config.dial_timeout).map_err(LinkError::Dial)?;

        let (old, generation) = {
            let mut slot = self.slot();
            slot.generation += 1;
            let old = std::mem::replace(&mut slot.conn, Arc::new(conn));
            (old, slot.generation)
        };
        old.close();
        self.set_state(LinkState::Connected);
        self.changed.notify_all();
        info!(generation, url = %self.config.url, "link redialed");
        Ok(())
    }

    /// Block until the generation moves past `after`, the timeout elapses, or
    /// the link shuts down. Returns whether a new generation is available.
    fn wait_for_generation(&self, after: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        while slot.generation == after && self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = match self.changed.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        slot.generation != after
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _slot = self.slot();
        self.changed.notify_all();
    }
}

/// Cloneable handle for queueing packets onto a link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    queue: SyncSender<WorkPacket>,
    capacity: usize,
}

impl LinkSender {
    /// Queue a packet without blocking.
    ///
    /// Returns [`LinkError::QueueFull`] when `queue_capacity` packets are
    /// already waiting and [`LinkError::Closed`] once the link has stopped.
    pub fn enqueue(&self, packet: WorkPacket) -> Result<()> {
        match self.queue.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(LinkError::Closed),
        }
    }
}

/// A single persistent connection to the consumer with one-shot redial.
///
/// Packets are written in queue order by a sender thread; results are read
/// by a receiver thread and published on a [`ResultFanout`].
pub struct ResilientLink {
    shared: Arc<Shared>,
    sender: LinkSender,
    fanout: ResultFanout,
    threads: Vec<JoinHandle<()>>,
}

impl ResilientLink {
    /// Dial the consumer and start the sender and receiver threads.
    ///
    /// The first dial is not retried.
    pub fn connect(config: LinkConfig) -> Result<Self> {
        let conn = dial(&config.url, config.dial_timeout).map_err(LinkError::Dial)?;
        info!(url = %config.url, conn_id = conn.id(), "link connected");

        let capacity = config.queue_capacity.max(1);
        let (queue, pending) = mpsc::sync_channel(capacity);
        let sender = LinkSender { queue, capacity };
        let fanout = ResultFanout::new(config.fanout_capacity);
        let shared = Arc::new(Shared {
            config,
            slot: Mutex::new(Slot {
                conn: Arc::new(conn),
                generation: 0,
            }),
            changed: Condvar::new(),
            state: AtomicU8::new(LinkState::Connected as u8),
            redials: AtomicU64::new(0),
            dial_lock: Mutex::new(()),
            running: AtomicBool::new(true),
        });

        let mut threads = Vec::with_capacity(2);
        let sender_shared = Arc::clone(&shared);
        threads.push(spawn("sockrelay-link-send", move || {
            send_loop(&sender_shared, &pending)
        })?);
        let receiver_shared = Arc::clone(&shared);
        let receiver_fanout = fanout.clone();
        let receiver = spawn("sockrelay-link-recv", move || {
            receive_loop(&receiver_shared, &receiver_fanout)
        });
        match receiver {
            Ok(handle) => threads.push(handle),
            Err(err) => {
                shared.stop();
                for handle in threads {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }

        Ok(Self {
            shared,
            sender,
            fanout,
            threads,
        })
    }

    /// A handle for queueing packets.
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Queue a packet on this link.
    pub fn enqueue(&self, packet: WorkPacket) -> Result<()> {
        self.sender.enqueue(packet)
    }

    pub fn fanout(&self) -> &ResultFanout {
        &self.fanout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.fanout.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Number of successful redials so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    /// Number of redial attempts so far, successful or not.
    pub fn redial_count(&self) -> u64 {
        self.shared.redials.load(Ordering::Acquire)
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    /// Stop both threads and close the connection.
    ///
    /// Packets still queued are discarded.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("link thread panicked");
            }
        }
        let (conn, _) = self.shared.current();
        conn.close();
        debug!(url = %self.shared.config.url, "link shut down");
    }
}

impl Drop for ResilientLink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ResilientLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientLink")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("redials", &self.redial_count())
            .finish()
    }
}

fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(LinkError::Thread)
}

fn send_loop(shared: &Shared, pending: &Receiver<WorkPacket>) {
    while shared.is_running() {
        match pending.recv_timeout(shared.config.poll_interval) {
            Ok(packet) => deliver(shared, packet),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("link sender stopped");
}

fn write_packet(conn: &Connection, packet: &WorkPacket) -> Result<()> {
    let message = encode_packet(packet, FrameKind::Text)?.into_message()?;
    conn.send(message).map_err(LinkError::from_write)
}

fn deliver(shared: &Shared, packet: WorkPacket) {
    let (conn, generation) = shared.current();
    match write_packet(&conn, &packet) {
        Ok(()) => trace!(generation, source = %packet.source_path, "packet written"),
        Err(LinkError::Broken(err)) => {
            warn!(generation, error = %err, "link broken, redialing");
            shared.mark_broken(generation);
            if let Err(err) = shared.redial(generation) {
                warn!(error = %err, source = %packet.source_path, "redial failed, packet dropped");
                return;
            }
            if !shared.config.retry_failed_packet {
                warn!(source = %packet.source_path, "packet dropped after redial");
                return;
            }
            let (conn, generation) = shared.current();
            match write_packet(&conn, &packet) {
                Ok(()) => debug!(generation, source = %packet.source_path, "packet rewritten after redial"),
                Err(err) => warn!(generation, error = %err, source = %packet.source_path, "rewrite failed, packet dropped"),
            }
        }
        Err(err) => {
            warn!(generation, error = %err, source = %packet.source_path, "write failed, packet dropped");
        }
    }
}

fn open_reader(
    conn: Arc<Connection>,
    poll: Duration,
) -> std::result::Result<Arc<Connection>, TransportError> {
    conn.set_read_timeout(Some(poll))?;
    Ok(conn)
}

fn receive_loop(shared: &Shared, fanout: &ResultFanout) {
    let mut reader: Option<(Arc<Connection>, u64)> = None;

    while shared.is_running() {
        let (conn, generation) = match reader.take() {
            Some((conn, generation)) if generation == shared.generation() => (conn, generation),
            _ => {
                let (current, generation) = shared.current();
                match open_reader(current, shared.config.poll_interval) {
                    Ok(conn) => (conn, generation),
                    Err(err) => {
                        debug!(generation, error = %err, "cannot read from link");
                        await_redial(shared, generation);
                        continue;
                    }
                }
            }
        };

        match conn.read_message() {
            Ok(Some(message)) => {
                publish(fanout, message);
                reader = Some((conn, generation));
            }
            Ok(None) => reader = Some((conn, generation)),
            Err(err) => {
                warn!(generation, error = %err, "link read failed, waiting for redial");
                await_redial(shared, generation);
            }
        }
    }
    debug!("link receiver stopped");
}

fn await_redial(shared: &Shared, generation: u64) {
    shared.mark_broken(generation);
    shared.wait_for_generation(generation, shared.config.reconnect_wait);
}

fn publish(fanout: &ResultFanout, message: Message) {
    let result = Frame::from_message(message).and_then(|frame| decode_result(&frame));
    match result {
        Ok(result) => {
            debug!(source = %result.packet.source_path, outcome = ?result.outcome(), "result received");
            fanout.publish(result);
        }
        Err(err) => warn!(error = %err, "discarding undecodable result"),
    }
}
