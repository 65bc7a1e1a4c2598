//! Per-connection reader/writer state machine (C3): demultiplexes the
//! inbound record stream into embedder callbacks and frames outbound
//! embedder data back onto the wire.
use crate::environ::Environ;
use crate::error::Error;
use crate::handler::Handler;
use crate::queue::{is_peer_gone, is_transient, OutputQueue, WriteOutcome};
use crate::record::{self, DecodeError, Header, ProtocolStatus, Role, HEADER_LEN};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{Read, Write};

/// Per-tick write budget, so one connection can't starve the others in the
/// event loop (spec.md §4.1).
const WRITE_BUDGET: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    WouldBlock,
}

/// A single FastCGI connection: the accepted socket, the reader's framing
/// state, the active request's lifecycle state, and the outbound queue.
///
/// Only one request may be active at a time (`request_id != 0` while
/// active); a second concurrent `BEGIN_REQUEST` is rejected with
/// `CANT_MPX_CONN` rather than accepted (spec.md §1 Non-goals).
pub struct Connection {
    stream: Option<TcpStream>,
    id: usize,
    token: mio::Token,

    request_id: u16,
    role: Role,
    flags: u8,

    header_buf: [u8; HEADER_LEN],
    header_used: usize,
    current_header: Option<Header>,
    content_remaining: usize,
    padding_remaining: usize,
    first: bool,

    buffer: Vec<u8>,
    param_buf: Vec<u8>,
    environ: Environ,

    write_queue: OutputQueue,
    closing: bool,
    read_suspended: bool,

    /// What [`mio::Registry`] currently has registered for this
    /// connection's fd, so the server's per-tick interest sync only calls
    /// `reregister`/`deregister` when [`Connection::wants_read`]/
    /// [`Connection::wants_write`] actually changed.
    registered_interest: Option<Interest>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, id: usize, token: mio::Token) -> Self {
        Connection {
            stream: Some(stream),
            id,
            token,
            request_id: 0,
            role: Role::Other(0),
            flags: 0,
            header_buf: [0; HEADER_LEN],
            header_used: 0,
            current_header: None,
            content_remaining: 0,
            padding_remaining: 0,
            first: false,
            buffer: Vec::new(),
            param_buf: Vec::new(),
            environ: Environ::new(),
            write_queue: OutputQueue::new(),
            closing: false,
            read_suspended: false,
            registered_interest: None,
        }
    }

    /// Stable identifier for this connection while it is live. Mirrors its
    /// slot in the server's connection table (spec.md §3 Server state,
    /// Invariant 4): it is reassigned only as a side effect of the table
    /// compacting another connection into a freed slot.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & record::KEEP_CONN != 0
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn environ(&self) -> &Environ {
        &self.environ
    }

    pub fn environ_lookup(&self, key: &[u8]) -> Option<&[u8]> {
        self.environ.get(key)
    }

    pub fn build_environ(&self) -> Vec<Vec<u8>> {
        self.environ.build_environ()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn token(&self) -> mio::Token {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: mio::Token) {
        self.token = token;
    }

    pub(crate) fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered_interest
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Option<Interest>) {
        self.registered_interest = interest;
    }

    /// Whether the server should currently hold read interest registered
    /// for this connection's fd.
    pub(crate) fn wants_read(&self) -> bool {
        !self.closing && !self.read_suspended
    }

    /// Whether the server should currently hold write interest
    /// registered for this connection's fd.
    pub(crate) fn wants_write(&self) -> bool {
        !self.closing && !self.write_queue.is_empty()
    }

    /// Stops consuming bytes from the peer until [`Connection::resume_read`]
    /// is called; the kernel's receive window provides backpressure.
    pub fn suspend_read(&mut self) {
        self.read_suspended = true;
    }

    pub fn resume_read(&mut self) {
        self.read_suspended = false;
    }

    /// Enters the closing state: no further embedder output or callbacks
    /// (besides teardown) happen for this connection. Safe to call from
    /// any callback, any number of times.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.write_queue.clear();
        self.buffer.clear();
        self.param_buf.clear();
        self.environ.clear();
        self.stream = None;
    }

    /// Enqueues an `STDOUT` record. An empty `data` is the embedder's
    /// end-of-stream marker.
    pub fn send_out(&mut self, handler: &mut impl Handler, data: &[u8]) {
        self.send_stream(handler, record::FCGI_STDOUT, data);
    }

    /// Enqueues an `STDERR` record. Symmetric to [`Connection::send_out`].
    pub fn send_err(&mut self, handler: &mut impl Handler, data: &[u8]) {
        self.send_stream(handler, record::FCGI_STDERR, data);
    }

    fn send_stream(&mut self, handler: &mut impl Handler, type_id: u8, data: &[u8]) {
        if self.closing {
            return;
        }
        let bytes = record::encode_stream(type_id, self.request_id, data);
        self.write_queue.append(bytes);
        self.kick_write(handler);
    }

    /// Enqueues `END_REQUEST` and clears the active request id. A no-op if
    /// no request is currently active, or the connection is closing.
    pub fn end_request(
        &mut self,
        handler: &mut impl Handler,
        app_status: i32,
        protocol_status: ProtocolStatus,
    ) {
        if self.closing || self.request_id == 0 {
            return;
        }
        let bytes = record::encode_end_request(self.request_id, app_status, protocol_status);
        self.write_queue.append(bytes);
        self.request_id = 0;
        self.kick_write(handler);
    }

    /// Drives the reader for as long as the socket keeps yielding data,
    /// the connection isn't suspended, and nothing closes it.
    pub(crate) fn handle_readable(&mut self, handler: &mut impl Handler, max_connections: usize) {
        loop {
            if self.closing || self.read_suspended {
                return;
            }
            match self.process_one_record(handler, max_connections) {
                Ok(Step::Continue) => continue,
                Ok(Step::WouldBlock) => return,
                Err(e) => {
                    self.fail(handler, e);
                    return;
                }
            }
        }
    }

    pub(crate) fn handle_writable(&mut self, handler: &mut impl Handler) {
        self.kick_write(handler);
    }

    /// Drains the write queue through the socket and reacts to the
    /// outcome: fires `wrote_data`, and closes the connection once the
    /// queue is empty with no active request and `KEEP_CONN` unset
    /// (spec.md §4.3 Writer path).
    fn kick_write(&mut self, handler: &mut impl Handler) {
        if self.closing {
            return;
        }
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let result = self.write_queue.write_to(&mut stream, WRITE_BUDGET);
        self.stream = Some(stream);

        match result {
            Ok(outcome) => {
                handler.wrote_data(self);
                if outcome == WriteOutcome::Done
                    && self.write_queue.is_empty()
                    && self.request_id == 0
                    && !self.keep_conn()
                {
                    self.close();
                }
            }
            Err(e) => self.fail(handler, e),
        }
    }

    fn fail(&mut self, handler: &mut impl Handler, err: Error) {
        if err.is_protocol_violation() {
            log::warn!(conn:id = self.id, error:err = err; "closing after protocol violation");
        } else {
            log::debug!(conn:id = self.id, error:err = err; "closing");
        }
        if self.request_id != 0 {
            handler.request_aborted(self);
        }
        self.close();
    }

    /// One step of the reader FSM: reads a header if needed, demultiplexes
    /// the current record, and drains its padding once content is spent.
    /// Returns `WouldBlock` the instant a read would block, leaving all
    /// counters positioned to resume on the next readable event.
    fn process_one_record(
        &mut self,
        handler: &mut impl Handler,
        max_connections: usize,
    ) -> Result<Step, Error> {
        if self.header_used < HEADER_LEN {
            if self.read_header_bytes()? == Step::WouldBlock {
                return Ok(Step::WouldBlock);
            }
            self.decode_header()?;
        }

        let header = self.current_header.expect("header decoded above");

        if header.type_id != record::FCGI_BEGIN_REQUEST
            && header.request_id != 0
            && header.request_id != self.request_id
        {
            // A record for a request we declined to multiplex: drain and
            // discard it without dispatching anywhere.
            if self.content_remaining + self.padding_remaining > 0 {
                if self.read_content()?.is_none() {
                    return Ok(Step::WouldBlock);
                }
            }
            if self.content_remaining + self.padding_remaining == 0 {
                self.header_used = 0;
            }
            return Ok(Step::Continue);
        }

        if self.first || self.content_remaining > 0 {
            self.first = false;
            let step = match header.type_id {
                record::FCGI_BEGIN_REQUEST => self.handle_begin_request(handler)?,
                record::FCGI_ABORT_REQUEST => self.handle_abort_request(handler)?,
                record::FCGI_PARAMS => self.handle_params(handler)?,
                record::FCGI_STDIN => self.handle_stdin(handler)?,
                record::FCGI_DATA => self.handle_data(handler)?,
                record::FCGI_GET_VALUES => self.handle_get_values(handler, max_connections)?,
                other => return Err(Error::DisallowedInboundType(other)),
            };
            if step == Step::WouldBlock {
                return Ok(Step::WouldBlock);
            }
        }

        if self.content_remaining == 0 {
            if self.padding_remaining == 0 {
                self.header_used = 0;
            } else {
                match self.read_chunk(self.padding_remaining)? {
                    None => return Ok(Step::WouldBlock),
                    Some(chunk) => {
                        self.padding_remaining -= chunk.len();
                        if self.padding_remaining == 0 {
                            self.header_used = 0;
                        }
                    }
                }
            }
        }

        Ok(Step::Continue)
    }

    fn read_header_bytes(&mut self) -> Result<Step, Error> {
        while self.header_used < HEADER_LEN {
            let stream = self.stream.as_mut().expect("reading on a closed connection");
            match stream.read(&mut self.header_buf[self.header_used..]) {
                Ok(0) => return Err(Error::PeerGone),
                Ok(n) => self.header_used += n,
                Err(e) if is_transient(&e) => return Ok(Step::WouldBlock),
                Err(e) if is_peer_gone(&e) => return Err(Error::PeerGone),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(Step::Continue)
    }

    fn decode_header(&mut self) -> Result<(), Error> {
        let header = Header::decode(self.header_buf);
        if header.version != record::VERSION_1 {
            return Err(Error::UnsupportedVersion(header.version));
        }
        self.content_remaining = header.content_length as usize;
        self.padding_remaining = header.padding_length as usize;
        self.first = true;
        self.buffer.clear();
        self.current_header = Some(header);
        Ok(())
    }

    /// A single non-blocking read of up to `max` bytes. `Ok(None)` means
    /// the socket would have blocked; the caller must return and wait for
    /// the next readable event.
    fn read_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>, Error> {
        if max == 0 {
            return Ok(Some(Vec::new()));
        }
        let stream = self.stream.as_mut().expect("reading on a closed connection");
        let mut buf = vec![0u8; max];
        match stream.read(&mut buf) {
            Ok(0) => Err(Error::PeerGone),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if is_transient(&e) => Ok(None),
            Err(e) if is_peer_gone(&e) => Err(Error::PeerGone),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Reads up to `content_remaining + padding_remaining` bytes in one
    /// non-blocking call, charging any over-read against padding first,
    /// and never returning more than `content_remaining` bytes to the
    /// caller (spec.md §4.3 Short-read handling).
    fn read_content(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let max = self.content_remaining + self.padding_remaining;
        let Some(mut buf) = self.read_chunk(max)? else {
            return Ok(None);
        };
        if buf.len() > self.content_remaining {
            self.padding_remaining -= buf.len() - self.content_remaining;
            buf.truncate(self.content_remaining);
            self.content_remaining = 0;
        } else {
            self.content_remaining -= buf.len();
        }
        Ok(Some(buf))
    }

    fn handle_begin_request(&mut self, handler: &mut impl Handler) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.content_length != 8 || header.request_id == 0 {
            return Err(Error::MalformedBeginRequest(header.content_length));
        }

        let Some(chunk) = self.read_content()? else {
            return Ok(Step::WouldBlock);
        };
        self.buffer.extend_from_slice(&chunk);

        if self.content_remaining == 0 {
            if self.request_id != 0 {
                let bytes =
                    record::encode_end_request(header.request_id, 0, ProtocolStatus::CantMpxConn);
                self.write_queue.append(bytes);
                self.kick_write(handler);
            } else {
                let role = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
                let flags = self.buffer[2];
                self.request_id = header.request_id;
                self.role = Role::from_id(role);
                self.flags = flags;
                self.param_buf.clear();
            }
        }
        Ok(Step::Continue)
    }

    fn handle_abort_request(&mut self, handler: &mut impl Handler) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.content_length != 0 || header.request_id == 0 {
            return Err(Error::MalformedAbortRequest(header.content_length));
        }
        handler.request_aborted(self);
        Ok(Step::Continue)
    }

    fn handle_params(&mut self, handler: &mut impl Handler) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.request_id == 0 {
            return Err(Error::ZeroRequestId(record::FCGI_PARAMS));
        }

        if self.content_remaining > 0 {
            let Some(chunk) = self.read_content()? else {
                return Ok(Step::WouldBlock);
            };
            self.param_buf.extend_from_slice(&chunk);
            return Ok(Step::Continue);
        }

        // An empty PARAMS record is the end-of-params marker: drain
        // whatever has accumulated.
        let (pairs, consumed) = record::decode_pairs(&self.param_buf).map_err(map_decode_err)?;
        if consumed != self.param_buf.len() {
            return Err(Error::TrailingParamBytes(self.param_buf.len() - consumed));
        }
        for (key, value) in pairs {
            self.environ.insert(key, value);
        }
        self.param_buf.clear();
        handler.new_request(self);
        Ok(Step::Continue)
    }

    fn handle_stdin(&mut self, handler: &mut impl Handler) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.request_id == 0 {
            return Err(Error::ZeroRequestId(record::FCGI_STDIN));
        }
        if self.content_remaining > 0 {
            let Some(chunk) = self.read_content()? else {
                return Ok(Step::WouldBlock);
            };
            handler.received_stdin(self, &chunk);
        } else {
            handler.received_stdin(self, &[]);
        }
        Ok(Step::Continue)
    }

    fn handle_data(&mut self, handler: &mut impl Handler) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.request_id == 0 {
            return Err(Error::ZeroRequestId(record::FCGI_DATA));
        }
        if self.content_remaining > 0 {
            let Some(chunk) = self.read_content()? else {
                return Ok(Step::WouldBlock);
            };
            handler.received_data(self, &chunk);
        } else {
            handler.received_data(self, &[]);
        }
        Ok(Step::Continue)
    }

    fn handle_get_values(
        &mut self,
        handler: &mut impl Handler,
        max_connections: usize,
    ) -> Result<Step, Error> {
        let header = self.current_header.expect("header decoded above");
        if header.request_id != 0 {
            return Err(Error::NonzeroGetValuesId(header.request_id));
        }

        if self.content_remaining > 0 {
            let Some(chunk) = self.read_content()? else {
                return Ok(Step::WouldBlock);
            };
            self.buffer.extend_from_slice(&chunk);
            if self.content_remaining > 0 {
                return Ok(Step::Continue);
            }
        }

        let (pairs, consumed) = record::decode_pairs(&self.buffer).map_err(map_decode_err)?;
        if consumed != self.buffer.len() {
            return Err(Error::TrailingGetValuesBytes(self.buffer.len() - consumed));
        }
        let names: Vec<Vec<u8>> = pairs.into_iter().map(|(key, _value)| key).collect();
        let bytes = record::encode_get_values_result(&names, max_connections);
        self.write_queue.append(bytes);
        self.buffer.clear();
        self.kick_write(handler);
        Ok(Step::Continue)
    }
}

fn map_decode_err(e: DecodeError) -> Error {
    match e {
        DecodeError::KeyTooLarge(len) => Error::PairTooLarge { kind: "key", len },
        DecodeError::ValueTooLarge(len) => Error::PairTooLarge { kind: "value", len },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingHandler {
        new_requests: usize,
        stdin_chunks: Vec<Vec<u8>>,
        data_chunks: Vec<Vec<u8>>,
        aborted: usize,
        wrote: usize,
    }

    impl Handler for RecordingHandler {
        fn new_request(&mut self, _conn: &mut Connection) {
            self.new_requests += 1;
        }
        fn received_stdin(&mut self, _conn: &mut Connection, chunk: &[u8]) {
            self.stdin_chunks.push(chunk.to_vec());
        }
        fn received_data(&mut self, _conn: &mut Connection, chunk: &[u8]) {
            self.data_chunks.push(chunk.to_vec());
        }
        fn request_aborted(&mut self, _conn: &mut Connection) {
            self.aborted += 1;
        }
        fn wrote_data(&mut self, _conn: &mut Connection) {
            self.wrote += 1;
        }
    }

    /// Sets up a loopback pair: `client` is a blocking std socket the test
    /// writes raw bytes into/reads from, `conn` is the non-blocking server
    /// side wrapped the way [`crate::server::Server`] would wrap it.
    fn loopback_pair() -> (StdTcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server_side);
        (client, Connection::new(stream, 0, mio::Token(2)))
    }

    /// Drives `conn.handle_readable` a handful of times with short sleeps
    /// in between, since the loopback socket may not have delivered bytes
    /// to the kernel buffer the instant they were written.
    fn drain_readable(conn: &mut Connection, handler: &mut RecordingHandler) {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            conn.handle_readable(handler, 1024);
            if conn.is_closing() || Instant::now() > deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn begin_request_bytes(request_id: u16, role: u16, flags: u8) -> Vec<u8> {
        let mut content = vec![0u8; 8];
        content[0..2].copy_from_slice(&role.to_be_bytes());
        content[2] = flags;
        let (header, padding) = record::encode_header(record::FCGI_BEGIN_REQUEST, request_id, 8);
        let mut out = header.to_vec();
        out.extend_from_slice(&content);
        out.resize(out.len() + padding as usize, 0);
        out
    }

    fn empty_record(type_id: u8, request_id: u16) -> Vec<u8> {
        let (header, _padding) = record::encode_header(type_id, request_id, 0);
        header.to_vec()
    }

    fn params_record(request_id: u16, pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut payload = Vec::new();
        let owned: Vec<(Vec<u8>, Vec<u8>)> =
            pairs.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        record::encode_pairs(&owned, &mut payload);
        let (header, padding) = record::encode_header(record::FCGI_PARAMS, request_id, payload.len() as u16);
        let mut out = header.to_vec();
        out.extend_from_slice(&payload);
        out.resize(out.len() + padding as usize, 0);
        out
    }

    #[test]
    fn minimal_request_delivers_new_request_and_eof_stdin() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        let mut bytes = begin_request_bytes(1, 1, 0);
        bytes.extend(params_record(1, &[]));
        bytes.extend(empty_record(record::FCGI_STDIN, 1));
        client.write_all(&bytes).unwrap();

        drain_readable(&mut conn, &mut handler);

        assert_eq!(handler.new_requests, 1);
        assert_eq!(handler.stdin_chunks, vec![Vec::<u8>::new()]);
        assert_eq!(conn.request_id(), 1);
        assert!(!conn.keep_conn());
    }

    #[test]
    fn multiplex_rejection_answers_cant_mpx_conn_for_the_new_id() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        let mut bytes = begin_request_bytes(1, 1, 0);
        bytes.extend(begin_request_bytes(2, 1, 0));
        client.write_all(&bytes).unwrap();

        drain_readable(&mut conn, &mut handler);

        assert_eq!(conn.request_id(), 1, "the original request stays active");

        client.set_nonblocking(true).unwrap();
        let mut reply = [0u8; 16];
        let n = read_with_retry(&mut client, &mut reply);
        let header = Header::decode(reply[0..8].try_into().unwrap());
        assert_eq!(header.type_id, record::FCGI_END_REQUEST);
        assert_eq!(header.request_id, 2);
        assert_eq!(reply[8 + 4], ProtocolStatus::CantMpxConn.id());
        let _ = n;
    }

    #[test]
    fn abort_request_notifies_handler() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        let mut bytes = begin_request_bytes(1, 1, 0);
        bytes.extend(params_record(1, &[]));
        bytes.extend(empty_record(record::FCGI_ABORT_REQUEST, 1));
        client.write_all(&bytes).unwrap();

        drain_readable(&mut conn, &mut handler);

        assert_eq!(handler.aborted, 1);
    }

    #[test]
    fn get_values_answers_only_known_names() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        let mut payload = Vec::new();
        record::encode_pairs(
            &[(b"FCGI_MPXS_CONNS".to_vec(), vec![])],
            &mut payload,
        );
        let (header, padding) =
            record::encode_header(record::FCGI_GET_VALUES, 0, payload.len() as u16);
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&payload);
        bytes.resize(bytes.len() + padding as usize, 0);
        client.write_all(&bytes).unwrap();

        drain_readable(&mut conn, &mut handler);

        client.set_nonblocking(true).unwrap();
        let mut reply = [0u8; 64];
        let n = read_with_retry(&mut client, &mut reply);
        let reply_header = Header::decode(reply[0..8].try_into().unwrap());
        assert_eq!(reply_header.type_id, record::FCGI_GET_VALUES_RESULT);
        let body = &reply[8..8 + reply_header.content_length as usize];
        let (pairs, consumed) = record::decode_pairs(body).unwrap();
        assert_eq!(consumed, body.len());
        assert_eq!(pairs, vec![(b"FCGI_MPXS_CONNS".to_vec(), b"0".to_vec())]);
        let _ = n;
    }

    #[test]
    fn get_values_with_a_truncated_trailing_pair_closes_the_connection() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        // A single-byte key length claiming a 5-byte key, but only 2 bytes
        // of key data actually follow: a well-formed GET_VALUES record
        // whose content is a malformed, truncated pair stream.
        let payload = vec![5u8, 0, b'a', b'b'];
        let (header, padding) =
            record::encode_header(record::FCGI_GET_VALUES, 0, payload.len() as u16);
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&payload);
        bytes.resize(bytes.len() + padding as usize, 0);
        client.write_all(&bytes).unwrap();

        drain_readable(&mut conn, &mut handler);

        assert!(conn.is_closing());
    }

    #[test]
    fn send_out_fragments_large_payloads_on_the_wire() {
        let (mut client, mut conn) = loopback_pair();
        let mut handler = RecordingHandler::default();

        let mut bytes = begin_request_bytes(1, 1, 0);
        bytes.extend(params_record(1, &[]));
        bytes.extend(empty_record(record::FCGI_STDIN, 1));
        client.write_all(&bytes).unwrap();
        drain_readable(&mut conn, &mut handler);

        let payload = vec![b'x'; 100_000];
        conn.send_out(&mut handler, &payload);
        conn.end_request(&mut handler, 0, ProtocolStatus::RequestComplete);

        client.set_nonblocking(true).unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut buf = [0u8; 16 * 1024];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("{e}"),
            }
        }

        let first_header = Header::decode(received[0..8].try_into().unwrap());
        assert_eq!(first_header.content_length, 65535);
        assert_eq!(first_header.padding_length, 1);
        let second_start = 8 + 65535 + 1;
        let second_header =
            Header::decode(received[second_start..second_start + 8].try_into().unwrap());
        assert_eq!(second_header.content_length, 34465);
        assert_eq!(second_header.padding_length, 7);
    }

    fn read_with_retry(client: &mut StdTcpStream, buf: &mut [u8]) -> usize {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match client.read(buf) {
                Ok(n) => return n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return 0;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("{e}"),
            }
        }
    }
}
