use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sockrelay_frame::{JobResult, WorkPacket};
use tungstenite::Message;

/// Minimal consumer for link tests.
///
/// Records every packet with the 1-based index of the connection it arrived
/// on and answers each with a successful result for `<path>.mp4`.
pub(crate) struct FakeRelay {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<(usize, WorkPacket)>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl FakeRelay {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("fake relay should bind");
        listener
            .set_nonblocking(true)
            .expect("listener should switch to non-blocking");
        let addr = listener.local_addr().expect("listener should have an address");

        let running = Arc::new(AtomicBool::new(true));
        let epoch = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let running = Arc::clone(&running);
            let epoch = Arc::clone(&epoch);
            let received = Arc::clone(&received);
            thread::spawn(move || {
                let connections = AtomicUsize::new(0);
                while running.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let index = connections.fetch_add(1, Ordering::SeqCst) + 1;
                            let epoch = Arc::clone(&epoch);
                            let received = Arc::clone(&received);
                            thread::spawn(move || serve(stream, index, &epoch, &received));
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => return,
                    }
                }
            })
        };

        Self {
            addr,
            running,
            epoch,
            received,
            acceptor: Mutex::new(Some(acceptor)),
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    pub(crate) fn received(&self) -> Vec<(usize, WorkPacket)> {
        self.received.lock().expect("received lock").clone()
    }

    /// Drop every open connection without a close frame.
    pub(crate) fn kill_connections(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Stop accepting; new dials are refused once this returns.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.acceptor.lock().expect("acceptor lock").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.kill_connections();
        self.stop();
    }
}

fn serve(
    stream: TcpStream,
    index: usize,
    epoch: &AtomicU64,
    received: &Mutex<Vec<(usize, WorkPacket)>>,
) {
    let started = epoch.load(Ordering::SeqCst);
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let Ok(mut socket) = tungstenite::accept(stream) else {
        return;
    };
    if socket
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(10)))
        .is_err()
    {
        return;
    }

    while epoch.load(Ordering::SeqCst) == started {
        match socket.read() {
            Ok(Message::Text(text)) => {
                let Ok(packet) = serde_json::from_str::<WorkPacket>(&text) else {
                    continue;
                };
                received
                    .lock()
                    .expect("received lock")
                    .push((index, packet.clone()));
                let converted = format!("{}.mp4", packet.source_path);
                let result = JobResult::success(packet, converted);
                let Ok(json) = serde_json::to_string(&result) else {
                    continue;
                };
                if socket.send(Message::Text(json)).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }
}
