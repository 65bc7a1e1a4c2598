/// The role a `BEGIN_REQUEST` record assigns to a connection.
///
/// The core never validates this value -- whether `DATA` records are
/// appropriate for `Filter`, or whether `Authorizer` makes sense at all,
/// is entirely up to the embedder. An unrecognized numeric role is kept
/// as `Other` rather than rejected, so the embedder can still answer with
/// `UNKNOWN_ROLE` itself if it wants to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Other(u16),
}

impl Role {
    pub fn id(&self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
            Self::Other(id) => *id,
        }
    }

    pub fn from_id(id: u16) -> Self {
        match id {
            1 => Self::Responder,
            2 => Self::Authorizer,
            3 => Self::Filter,
            other => Self::Other(other),
        }
    }
}
