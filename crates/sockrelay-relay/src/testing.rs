use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use sockrelay_transport::{Connection, Role};

/// Server side (non-blocking, shared) and client side (blocking with a read
/// timeout) of a loopback WebSocket pair.
pub(crate) fn connection_pair() -> (Arc<Connection>, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("loopback bind should succeed");
    let addr = listener.local_addr().expect("listener should have an address");
    let client = TcpStream::connect(addr).expect("loopback connect should succeed");
    let (server, _) = listener.accept().expect("accept should succeed");
    server
        .set_nonblocking(true)
        .expect("server side should switch to non-blocking");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("client read timeout should apply");

    (
        Arc::new(
            Connection::from_stream(server, Role::Server)
                .expect("server side should wrap"),
        ),
        Connection::from_stream(client, Role::Client).expect("client side should wrap"),
    )
}
