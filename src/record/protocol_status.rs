/// The `protocolStatus` byte carried in an `END_REQUEST` record.
///
/// These are only ever produced by this side of the connection -- the wire
/// never carries one inbound, so there is no `from_record_byte`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolStatus {
    /// The request completed normally; the embedder's `app_status` carries
    /// the meaningful result.
    RequestComplete,
    /// A second `BEGIN_REQUEST` arrived while one was already active on this
    /// connection.
    CantMpxConn,
    /// Available for the embedder to signal it is out of some resource.
    Overloaded,
    /// Available for the embedder to signal it does not implement the role
    /// the peer asked for.
    UnknownRole,
}

impl ProtocolStatus {
    pub fn id(&self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMpxConn => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }
}
