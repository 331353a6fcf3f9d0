use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use sockrelay_transport::{Connection, Role};

/// Connected pair: a non-blocking server side ready for registration and a
/// blocking client side used to drive it.
pub(crate) fn server_connection() -> (Arc<Connection>, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();

    (
        Arc::new(Connection::from_stream(server, Role::Server).unwrap()),
        Connection::from_stream(client, Role::Client).unwrap(),
    )
}
