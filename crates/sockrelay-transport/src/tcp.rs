use std::cell::Cell;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::handshake::HandshakeError;
use tungstenite::http::StatusCode;
use tungstenite::protocol::Role;

use crate::connection::{Connection, SocketStream};
use crate::error::{Result, TransportError};

/// Default path of the upgrade endpoint.
pub const DEFAULT_UPGRADE_PATH: &str = "/websocket";

/// Default timeout for a single handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a TCP listener for the upgrade endpoint.
pub fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr = %listener.local_addr().map_or_else(|_| addr.to_string(), |a| a.to_string()), "listening for upgrade requests");
    Ok(listener)
}

/// Promote an accepted TCP stream to a WebSocket connection.
///
/// The handshake runs on the blocking stream, bounded by `timeout`. Requests
/// for any path other than `path` get `404 Not Found`. On success the stream
/// is switched to non-blocking mode for readiness-driven reads.
pub fn upgrade(stream: TcpStream, path: &str, timeout: Duration) -> Result<Connection> {
    let peer = stream.peer_addr().ok();
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let rejected_path: Cell<Option<String>> = Cell::new(None);
    let check_path = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let requested = request.uri().path();
        if requested == path {
            return Ok(response);
        }
        rejected_path.set(Some(requested.to_string()));
        let mut error = ErrorResponse::new(Some(format!("no upgrade endpoint at {requested}")));
        *error.status_mut() = StatusCode::NOT_FOUND;
        Err(error)
    };

    let socket = match tungstenite::accept_hdr(SocketStream::new(stream), check_path) {
        Ok(socket) => socket,
        Err(HandshakeError::Failure(err)) => {
            if let Some(path) = rejected_path.take() {
                return Err(TransportError::Rejected { path });
            }
            return Err(TransportError::handshake(peer, err.to_string()));
        }
        Err(HandshakeError::Interrupted(_)) => {
            return Err(TransportError::handshake(peer, "handshake interrupted"));
        }
    };

    let stream = socket.get_ref().get_ref();
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    stream.set_nonblocking(true)?;

    let connection = Connection::new(socket, Role::Server)?;
    debug!(conn_id = connection.id(), ?peer, "upgraded connection");
    Ok(connection)
}

/// Dial a `ws://` endpoint and complete the client handshake.
///
/// The returned connection is blocking; `timeout` bounds the TCP connect, the
/// handshake, and every later write.
pub fn dial(url: &str, timeout: Duration) -> Result<Connection> {
    let request = url
        .into_client_request()
        .map_err(|err| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

    let uri = request.uri();
    if uri.scheme_str() != Some("ws") {
        return Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "only ws:// endpoints are supported".to_string(),
        });
    }
    let host = uri.host().ok_or_else(|| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = uri.port_u16().unwrap_or(80);

    let stream = connect_first(url, (host, port), timeout)?;
    let peer = stream.peer_addr().ok();
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let (socket, _response) = match tungstenite::client(request, SocketStream::new(stream)) {
        Ok(pair) => pair,
        Err(HandshakeError::Failure(err)) => {
            return Err(TransportError::handshake(peer, err.to_string()));
        }
        Err(HandshakeError::Interrupted(_)) => {
            return Err(TransportError::handshake(peer, "handshake interrupted"));
        }
    };
    socket.get_ref().get_ref().set_read_timeout(None)?;

    let connection = Connection::new(socket, Role::Client)?.with_write_timeout(timeout);
    debug!(conn_id = connection.id(), url, "dialed connection");
    Ok(connection)
}

fn connect_first(url: &str, target: (&str, u16), timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|source| TransportError::Connect {
            url: url.to_string(),
            source,
        })?
        .collect();

    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "host resolved to no addresses",
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(TransportError::Connect {
        url: url.to_string(),
        source: last_err,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use tungstenite::Message;

    use super::*;

    fn local_listener() -> (TcpListener, String) {
        let listener = bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, format!("ws://{addr}"))
    }

    #[test]
    fn dial_and_upgrade_exchange_messages() {
        let (listener, base) = local_listener();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = upgrade(stream, DEFAULT_UPGRADE_PATH, DEFAULT_HANDSHAKE_TIMEOUT).unwrap();
            assert_eq!(conn.role(), Role::Server);
            // Non-blocking after upgrade: poll until the message arrives.
            loop {
                if let Some(message) = conn.read_message().unwrap() {
                    conn.send(message).unwrap();
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        let client = dial(&format!("{base}/websocket"), Duration::from_secs(2)).unwrap();
        client.send(Message::Text("echo me".into())).unwrap();
        let reply = client.read_message().unwrap();
        assert_eq!(reply, Some(Message::Text("echo me".into())));

        server.join().unwrap();
    }

    #[test]
    fn upgrade_rejects_unknown_path_with_404() {
        let (listener, base) = local_listener();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            upgrade(stream, DEFAULT_UPGRADE_PATH, DEFAULT_HANDSHAKE_TIMEOUT)
        });

        let err = dial(&format!("{base}/elsewhere"), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Handshake { .. }), "{err}");
        assert!(err.to_string().contains("404"), "{err}");

        let server_err = server.join().unwrap().unwrap_err();
        assert!(
            matches!(server_err, TransportError::Rejected { ref path } if path == "/elsewhere"),
            "{server_err}"
        );
    }

    #[test]
    fn upgrade_fails_on_plain_http_request() {
        let (listener, _base) = local_listener();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            upgrade(stream, DEFAULT_UPGRADE_PATH, DEFAULT_HANDSHAKE_TIMEOUT)
        });

        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(b"GET /websocket HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        let _ = raw.read_to_string(&mut response);

        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Handshake { .. }), "{err}");
    }

    #[test]
    fn dial_rejects_non_ws_scheme() {
        let err = dial("http://127.0.0.1:1/websocket", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[test]
    fn dial_reports_connect_failure() {
        // Bind then drop to obtain a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = dial(&format!("ws://{addr}/websocket"), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }
}
