use crate::connection::Connection;

/// The set of events the embedder may observe while the core demultiplexes
/// a connection's record stream.
///
/// Every method has a no-op default body, so an embedder only overrides
/// the ones it cares about -- the Rust equivalent of `libafcgi.c`'s
/// nullable callback-struct fields. All methods run synchronously on the
/// event-loop thread, in the order of the wire events that triggered them,
/// and may call back into `conn` (including closing it) without
/// restriction.
#[allow(unused_variables)]
pub trait Handler {
    /// A connection was just accepted.
    fn new_connection(&mut self, conn: &mut Connection) {}

    /// `PARAMS` ended (the empty, terminating record arrived). `conn`'s
    /// environ is fully populated and its role/flags are set.
    fn new_request(&mut self, conn: &mut Connection) {}

    /// A `STDIN` payload arrived. An empty `chunk` marks end of stream.
    fn received_stdin(&mut self, conn: &mut Connection, chunk: &[u8]) {}

    /// A `DATA` payload arrived. Symmetric to [`Handler::received_stdin`].
    fn received_data(&mut self, conn: &mut Connection, chunk: &[u8]) {}

    /// The peer sent `ABORT_REQUEST`, or the server is shutting down with
    /// this request still live.
    fn request_aborted(&mut self, conn: &mut Connection) {}

    /// The write queue was drained by a successful write.
    fn wrote_data(&mut self, conn: &mut Connection) {}

    /// The connection is about to be freed. No further callbacks will be
    /// invoked for it; `conn`'s fd is already closed.
    fn reset_connection(&mut self, conn: &mut Connection) {}
}
