//! Connection acceptor and table (C4): accepts new connections, enforces
//! the connection cap, owns the connection table, and coordinates shutdown
//! and deferred cleanup.
//!
//! The event loop itself runs on a single background thread (spec.md §5:
//! "single-threaded cooperative. One event loop owns all file
//! descriptors"); [`ServerHandle`] is just a cross-thread handle the
//! embedder uses to wait for that thread to exit or ask it to stop,
//! mirrored on the teacher's `server_handle.rs`/`event_loop.rs` split.
use crate::connection::Connection;
use crate::handler::Handler;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

const LISTENER: Token = Token(0);
const SHUTDOWN: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

/// Sensible default for [`ServerConfig::max_connections`] when the
/// embedder doesn't set one (SPEC_FULL.md §4.4).
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Builder for the one piece of configuration the core exposes: the
/// connection cap (spec.md §4.4, §6 "Limits").
///
/// Everything else -- binding the listening socket, application-level
/// request semantics, logging setup -- is the embedder's job (spec.md §1
/// "Out of scope").
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of simultaneously accepted connections. Adaptively
    /// lowered at runtime if `accept` ever fails with `EMFILE`.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Spawns the event loop on a background thread and starts accepting
    /// connections on `listener`, which must already be bound (spec.md §1:
    /// "the core is handed a ready accepting file descriptor").
    ///
    /// Returns a [`ServerHandle`] the caller uses to wait for the loop to
    /// exit ([`ServerHandle::join`]) or ask it to shut down
    /// ([`ServerHandle::stop`]).
    pub fn start<H>(self, mut listener: TcpListener, handler: H) -> io::Result<ServerHandle>
    where
        H: Handler + Send + 'static,
    {
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let server_waker = Waker::new(poll.registry(), SHUTDOWN)?;

        let (signal_shutdown, observe_shutdown) = sync_channel(0);

        let server = Server {
            listener,
            poll,
            events: Events::with_capacity(128),
            handler,
            connections: Vec::new(),
            token_to_slot: HashMap::new(),
            max_connections: self.max_connections,
            next_token: FIRST_CONN_TOKEN,
            accepting: true,
        };

        let server_loop = thread::spawn(move || run(server, signal_shutdown));

        Ok(ServerHandle {
            address,
            server_loop,
            server_waker,
            observe_shutdown,
        })
    }
}

/// The reason the event loop exited.
#[derive(Debug, Default)]
pub enum ServerExitReason {
    /// `server_stop`/`ServerHandle::stop` was called and all in-flight
    /// requests were given a chance to finish (spec.md §4.4 "Shutdown").
    #[default]
    Normal,
    /// An unrecoverable error (anything other than `EAGAIN`/`EINTR`/
    /// `EMFILE`) on the listening socket or the poller itself (spec.md §7
    /// "Fatal").
    Err(io::Error),
    /// The event loop thread panicked; the payload is the panic message,
    /// when it was a plain string.
    Panic(String),
}

/// Handle to a running FastCGI server.
pub struct ServerHandle {
    address: SocketAddr,
    server_loop: JoinHandle<ServerExitReason>,
    server_waker: Waker,
    observe_shutdown: Receiver<()>,
}

impl ServerHandle {
    /// Blocks until the event loop exits and returns why. Does not itself
    /// ask the loop to stop.
    pub fn join(self) -> ServerExitReason {
        match self.server_loop.join() {
            Ok(reason) => reason,
            Err(payload) => match payload.downcast_ref::<String>() {
                Some(s) => ServerExitReason::Panic(s.clone()),
                None => match payload.downcast_ref::<&str>() {
                    Some(s) => ServerExitReason::Panic(s.to_string()),
                    None => ServerExitReason::Panic(String::new()),
                },
            },
        }
    }

    /// Asks the event loop to stop: every still-live request is aborted
    /// (`request_aborted`), every connection is reset and freed, then the
    /// loop thread exits. Blocks until that has happened (spec.md §4.4
    /// "Shutdown", `server_free`). Best-effort: if the loop already exited
    /// on its own (e.g. a fatal I/O error), this returns immediately.
    pub fn stop(self) {
        let Ok(()) = self.server_waker.wake() else {
            return;
        };
        let _ = self.observe_shutdown.recv();
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

struct Server<H> {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    handler: H,
    connections: Vec<Connection>,
    token_to_slot: HashMap<Token, usize>,
    max_connections: usize,
    next_token: usize,
    /// Whether the listener currently has read interest registered.
    /// Cleared while the connection table is at capacity or after
    /// `EMFILE` (spec.md §4.4).
    accepting: bool,
}

fn run<H: Handler>(mut server: Server<H>, signal_shutdown: SyncSender<()>) -> ServerExitReason {
    loop {
        if let Err(e) = server.poll.poll(&mut server.events, None) {
            return ServerExitReason::Err(e);
        }

        // Collect readiness first: the loop body needs `&mut server` for
        // dispatch, which a live borrow of `server.events` would forbid.
        let ready: Vec<(Token, bool, bool)> = server
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        let mut shutdown_requested = false;

        for (token, readable, writable) in ready {
            match token {
                LISTENER => {
                    if let Err(e) = server.accept_loop() {
                        return ServerExitReason::Err(e);
                    }
                }
                SHUTDOWN => shutdown_requested = true,
                token => server.service_connection(token, readable, writable),
            }
        }

        server.reap_closed();

        if shutdown_requested {
            server.shutdown_and_drain();
            let _ = signal_shutdown.send(());
            return ServerExitReason::Normal;
        }
    }
}

impl<H: Handler> Server<H> {
    /// Accepts until the listener would block, matching spec.md §4.4:
    /// "accept in a loop until EAGAIN/EINTR/ECONNABORTED".
    fn accept_loop(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.add_connection(stream)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) if is_emfile(&e) => {
                    self.handle_emfile();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn add_connection(&mut self, mut stream: mio::net::TcpStream) -> io::Result<()> {
        // Rust's std (and therefore mio) accepts with `accept4`/`WSASocket`
        // flags that already set non-blocking + close-on-exec; there is no
        // further fd-flag work to do here (spec.md §6 "Socket
        // prerequisites").
        let slot = self.connections.len();
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let mut conn = Connection::new(stream, slot, token);
        conn.set_registered_interest(Some(Interest::READABLE));
        self.handler.new_connection(&mut conn);
        self.connections.push(conn);
        self.token_to_slot.insert(token, slot);

        // `new_connection` may have already written something (a banner,
        // say) that didn't fully drain; pick that up now rather than
        // waiting for a read event that may never come.
        self.sync_interest(slot);

        if self.connections.len() >= self.max_connections {
            self.set_accepting(false);
        }
        Ok(())
    }

    /// `EMFILE`: halve the connection cap and stop accepting until
    /// capacity frees up (spec.md §4.4, §7 "Accept exhaustion").
    fn handle_emfile(&mut self) {
        let new_max = if self.max_connections == 0 {
            self.connections.len() / 2
        } else {
            self.max_connections / 2
        };
        let new_max = new_max.max(1);
        log::warn!(
            old_max = self.max_connections, new_max = new_max;
            "accept() failed with EMFILE; lowering max_connections"
        );
        self.max_connections = new_max;
        self.set_accepting(false);
    }

    fn set_accepting(&mut self, accept: bool) {
        if accept == self.accepting {
            return;
        }
        let result = if accept {
            self.poll
                .registry()
                .register(&mut self.listener, LISTENER, Interest::READABLE)
        } else {
            self.poll.registry().deregister(&mut self.listener)
        };
        if let Err(e) = result {
            log::error!(error:err = e; "failed to toggle listener read interest");
            return;
        }
        self.accepting = accept;
    }

    fn service_connection(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(&slot) = self.token_to_slot.get(&token) else {
            return;
        };

        if readable {
            self.connections[slot].handle_readable(&mut self.handler, self.max_connections);
        }
        if writable && !self.connections[slot].is_closing() {
            self.connections[slot].handle_writable(&mut self.handler);
        }
        self.sync_interest(slot);
    }

    /// Reregisters `slot`'s fd only when
    /// [`Connection::wants_read`]/[`Connection::wants_write`] actually
    /// changed since the last sync (spec.md §4.3 "Writer path").
    fn sync_interest(&mut self, slot: usize) {
        let conn = &mut self.connections[slot];
        if conn.is_closing() {
            return;
        }

        let desired = match (conn.wants_read(), conn.wants_write()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        if desired == conn.registered_interest() {
            return;
        }

        if let Some(stream) = conn.stream_mut() {
            let registry = self.poll.registry();
            let result = match desired {
                Some(interest) => registry.reregister(stream, conn.token(), interest),
                None => registry.deregister(stream),
            };
            if let Err(e) = result {
                log::warn!(conn:id = conn.id(), error:err = e; "failed to update poll interest");
            }
        }
        conn.set_registered_interest(desired);
    }

    /// Deferred cleanup (spec.md §3 Invariant 4, §4.4 "Deferred cleanup"):
    /// every closing connection is freed here, outside the call stack of
    /// any reader/writer/callback, by swapping the table's last live entry
    /// into the freed slot and updating its id.
    fn reap_closed(&mut self) {
        let mut i = 0;
        let mut freed_any = false;
        while i < self.connections.len() {
            if !self.connections[i].is_closing() {
                i += 1;
                continue;
            }

            self.handler.reset_connection(&mut self.connections[i]);
            self.token_to_slot.remove(&self.connections[i].token());

            let last = self.connections.len() - 1;
            if i != last {
                self.connections.swap(i, last);
                self.connections[i].set_id(i);
                let moved_token = self.connections[i].token();
                self.token_to_slot.insert(moved_token, i);
            }
            self.connections.pop();
            freed_any = true;
            // Don't advance `i`: the entry swapped into this slot (if any)
            // still needs to be checked.
        }

        if freed_any && !self.accepting && self.connections.len() < self.max_connections {
            self.set_accepting(true);
        }
    }

    /// `server_free`-equivalent full teardown (spec.md §4.4 "Shutdown"):
    /// aborts every still-live request, resets and frees every connection.
    fn shutdown_and_drain(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);

        for i in 0..self.connections.len() {
            if self.connections[i].request_id() != 0 {
                self.handler.request_aborted(&mut self.connections[i]);
            }
            self.connections[i].close();
        }
        for conn in &mut self.connections {
            self.handler.reset_connection(conn);
        }
        self.connections.clear();
        self.token_to_slot.clear();
    }
}

/// Whether `e` represents `EMFILE`. `std::io::ErrorKind` has no portable
/// variant for it, so this checks the raw errno directly; `EMFILE` is `24`
/// on Linux and the BSDs (including macOS).
fn is_emfile(e: &io::Error) -> bool {
    cfg!(unix) && e.raw_os_error() == Some(24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{self, ProtocolStatus};
    use assert_matches::assert_matches;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct EchoHandler {
        connected: usize,
        reset: usize,
    }

    impl Handler for EchoHandler {
        fn new_connection(&mut self, _conn: &mut Connection) {
            self.connected += 1;
        }
        fn new_request(&mut self, conn: &mut Connection) {
            conn.send_out(self, b"");
        }
        fn reset_connection(&mut self, _conn: &mut Connection) {
            self.reset += 1;
        }
    }

    fn free_addr() -> SocketAddr {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    #[test]
    fn accepts_a_connection_and_reports_it_to_the_handler() {
        let addr = free_addr();
        let listener = TcpListener::bind(addr).unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = ServerConfig::new().start(listener, EchoHandler::default()).unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(client);

        handle.stop();
    }

    #[test]
    fn get_values_round_trips_over_a_real_socket() {
        let addr = free_addr();
        let listener = TcpListener::bind(addr).unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = ServerConfig::new().start(listener, EchoHandler::default()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        let mut payload = Vec::new();
        record::encode_pairs(&[(b"FCGI_MPXS_CONNS".to_vec(), vec![])], &mut payload);
        let (header, padding) =
            record::encode_header(record::FCGI_GET_VALUES, 0, payload.len() as u16);
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&payload);
        bytes.resize(bytes.len() + padding as usize, 0);
        client.write_all(&bytes).unwrap();

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut reply = [0u8; 64];
        let n = read_full(&mut client, &mut reply, 8);
        assert!(n >= 8);
        let reply_header = record::Header::decode(reply[0..8].try_into().unwrap());
        assert_eq!(reply_header.type_id, record::FCGI_GET_VALUES_RESULT);

        handle.stop();
    }

    fn read_full(stream: &mut StdTcpStream, buf: &mut [u8], want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut total = 0;
        while total < want && Instant::now() < deadline {
            match stream.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        total
    }

    #[test]
    fn emfile_detection_matches_the_platform_errno() {
        assert_matches!(io::Error::from_raw_os_error(24), ref e if is_emfile(e));
        assert_matches!(io::Error::from_raw_os_error(9), ref e if !is_emfile(e));
    }

    #[test]
    fn stop_makes_the_event_loop_exit_normally() {
        let addr = free_addr();
        let listener = TcpListener::bind(addr).unwrap();
        let handle = ServerConfig::new().start(listener, EchoHandler::default()).unwrap();

        let ServerHandle {
            server_loop,
            server_waker,
            observe_shutdown,
            ..
        } = handle;

        let rendezvous = thread::spawn(move || observe_shutdown.recv());
        server_waker.wake().expect("failed to wake the event loop");
        rendezvous.join().unwrap().unwrap();

        assert_matches!(server_loop.join().unwrap(), ServerExitReason::Normal);
    }

    #[test]
    fn end_request_flows_through_a_real_accepted_connection() {
        let addr = free_addr();
        let listener = TcpListener::bind(addr).unwrap();
        let addr = listener.local_addr().unwrap();

        struct Responder;
        impl Handler for Responder {
            fn new_request(&mut self, conn: &mut Connection) {
                conn.send_out(self, b"hi");
                conn.end_request(self, 0, ProtocolStatus::RequestComplete);
            }
        }

        let handle = ServerConfig::new().start(listener, Responder).unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        let mut bytes = Vec::new();
        let (h, p) = record::encode_header(record::FCGI_BEGIN_REQUEST, 1, 8);
        bytes.extend_from_slice(&h);
        bytes.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        bytes.resize(bytes.len() + p as usize, 0);
        let (h, _) = record::encode_header(record::FCGI_PARAMS, 1, 0);
        bytes.extend_from_slice(&h);
        let (h, _) = record::encode_header(record::FCGI_STDIN, 1, 0);
        bytes.extend_from_slice(&h);
        client.write_all(&bytes).unwrap();

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if received.len() >= 16 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        assert!(received.len() >= 8);
        let stdout_header = record::Header::decode(received[0..8].try_into().unwrap());
        assert_eq!(stdout_header.type_id, record::FCGI_STDOUT);

        handle.stop();
    }
}
