//! Manual smoke test for the `Handler` trait against a real socket.
//!
//! Not part of the crate's public contract -- just something to point a
//! real FastCGI upstream (e.g. nginx's `fastcgi_pass`) at while poking at
//! this crate by hand. Echoes the request body back as `STDOUT` and logs
//! every lifecycle event it sees.
use fastcgi_core::{Connection, Handler, ServerConfig};
use mio::net::TcpListener;
use std::net::SocketAddr;

struct Echo;

impl Handler for Echo {
    fn new_connection(&mut self, conn: &mut Connection) {
        log::info!("connection {}: accepted", conn.id());
    }

    fn new_request(&mut self, conn: &mut Connection) {
        let method = conn
            .environ_lookup(b"REQUEST_METHOD")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        log::info!(
            "connection {}: new request, role={:?} method={method}",
            conn.id(),
            conn.role()
        );
        conn.send_out(self, b"Status: 200\r\nContent-Type: text/plain\r\n\r\n");
    }

    fn received_stdin(&mut self, conn: &mut Connection, chunk: &[u8]) {
        if chunk.is_empty() {
            conn.end_request(self, 0, fastcgi_core::ProtocolStatus::RequestComplete);
            return;
        }
        conn.send_out(self, chunk);
    }

    fn request_aborted(&mut self, conn: &mut Connection) {
        log::info!("connection {}: request aborted", conn.id());
    }

    fn reset_connection(&mut self, conn: &mut Connection) {
        log::info!("connection {}: freed", conn.id());
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()
        .expect("usage: echo [HOST:PORT]");

    let listener = TcpListener::bind(addr)?;
    log::info!("listening on {addr}");

    let handle = ServerConfig::new()
        .max_connections(64)
        .start(listener, Echo)?;

    // No signal-handling crate in this crate's dependency graph: this demo
    // just blocks until the loop exits on its own (e.g. a fatal socket
    // error). A real embedder holds on to the handle and calls
    // `ServerHandle::stop()` from its own shutdown path instead.
    match handle.join() {
        fastcgi_core::ServerExitReason::Normal => Ok(()),
        fastcgi_core::ServerExitReason::Err(e) => Err(e),
        fastcgi_core::ServerExitReason::Panic(msg) => {
            panic!("event loop panicked: {msg}")
        }
    }
}
