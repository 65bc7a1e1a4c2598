use std::io;

/// Everything that can go wrong while demultiplexing a connection's record
/// stream.
///
/// Every variant here ends the connection's lifetime one way or another:
/// I/O failures close it immediately, protocol violations close it as soon
/// as the reader notices them (see [`Error::is_protocol_violation`]). None
/// of these escape to the embedder as a `Result` -- they surface only
/// through the `request_aborted`/`reset_connection` callbacks on
/// [`crate::Handler`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed by peer")]
    PeerGone,

    #[error("unsupported FastCGI version: {0}")]
    UnsupportedVersion(u8),

    #[error("received record type {0}, which this core never accepts as inbound")]
    DisallowedInboundType(u8),

    #[error("BEGIN_REQUEST content length was {0}, expected 8")]
    MalformedBeginRequest(u16),

    #[error("ABORT_REQUEST carried a non-empty payload ({0} bytes)")]
    MalformedAbortRequest(u16),

    #[error("record of type {0} is not valid with request id 0")]
    ZeroRequestId(u8),

    #[error("GET_VALUES record carried a nonzero request id {0}")]
    NonzeroGetValuesId(u16),

    #[error("{kind} length {len} exceeds the configured limit")]
    PairTooLarge { kind: &'static str, len: u32 },

    #[error("PARAMS stream ended with {0} bytes that did not form a complete pair")]
    TrailingParamBytes(usize),

    #[error("GET_VALUES content ended with {0} bytes that did not form a complete pair")]
    TrailingGetValuesBytes(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error represents a protocol violation, as opposed to a
    /// transport-level failure. Protocol violations are logged at `warn`;
    /// plain disconnects are routine and logged at `debug`.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Error::PeerGone | Error::Io(_))
    }
}
