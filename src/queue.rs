use crate::error::Error;
use std::collections::VecDeque;
use std::io::{self, Write};

/// Outcome of a single [`OutputQueue::write_to`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The budget was exhausted, or the queue drained completely before it
    /// was.
    Done,
    /// The socket would have blocked; the caller should wait for the next
    /// writable-readiness event.
    WouldBlock,
}

/// Byte-exact ordered buffer of pending outbound chunks.
///
/// Tracks a `head_offset` into the front chunk so a short write never loses
/// track of how much of that chunk still needs to go out, and a
/// `total_length` so callers can cheaply ask "is there anything to write".
#[derive(Debug, Default)]
pub struct OutputQueue {
    chunks: VecDeque<Vec<u8>>,
    head_offset: usize,
    total_length: usize,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Number of distinct chunks currently queued. Used only to decide
    /// whether a corking hint would be worthwhile; see module docs on
    /// [`OutputQueue::write_to`].
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Appends `chunk` to the tail of the queue. Empty chunks are dropped so
    /// the invariant "the queue never holds an empty chunk" always holds.
    pub fn append(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_length += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Frees every queued chunk and resets all bookkeeping to zero.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.head_offset = 0;
        self.total_length = 0;
    }

    /// Drains the queue into `writer`, writing at most `max_bytes` total.
    ///
    /// Real corking (e.g. `TCP_CORK`) is a pure optimization the protocol
    /// never depends on for correctness, and is deliberately not
    /// implemented here -- there is no socket-option crate in this crate's
    /// dependency graph, and adding one solely for this hint isn't worth
    /// it. `chunk_count()` is exposed so an embedder with its own access to
    /// the raw fd can apply the hint around this call if it wants to.
    pub fn write_to<W: Write>(
        &mut self,
        writer: &mut W,
        max_bytes: usize,
    ) -> Result<WriteOutcome, Error> {
        let mut budget = max_bytes;

        while self.total_length > 0 && budget > 0 {
            let front = self
                .chunks
                .front()
                .expect("total_length > 0 implies a front chunk");
            let available = front.len() - self.head_offset;
            let to_write = available.min(budget);

            match writer.write(&front[self.head_offset..self.head_offset + to_write]) {
                Ok(0) => return Err(Error::PeerGone),
                Ok(n) => {
                    self.head_offset += n;
                    self.total_length -= n;
                    budget -= n;
                    if self.head_offset == front.len() {
                        self.chunks.pop_front();
                        self.head_offset = 0;
                    }
                }
                Err(e) if is_transient(&e) => return Ok(WriteOutcome::WouldBlock),
                Err(e) if is_peer_gone(&e) => return Err(Error::PeerGone),
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(WriteOutcome::Done)
    }
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

pub(crate) fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}
