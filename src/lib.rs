//! An embeddable, single-threaded FastCGI protocol engine.
//!
//! This crate demultiplexes a FastCGI upstream's record stream into
//! per-request events (see [`Handler`]) and lets the embedder emit
//! response data and lifecycle events back over the same non-blocking
//! connection (see [`Connection`]). It owns protocol framing, parameter
//! decoding, and connection bookkeeping; it knows nothing about what a
//! request's environment variables or response body *mean* -- that's the
//! embedder's job.
//!
//! Out of scope (the embedder's responsibility): creating and binding the
//! listening socket, CGI-level application semantics, logging
//! configuration, TLS.
mod connection;
mod environ;
mod error;
mod handler;
mod queue;
mod record;
mod server;

pub use connection::Connection;
pub use environ::Environ;
pub use error::Error;
pub use handler::Handler;
pub use record::{ProtocolStatus, Role, MAX_KEYLEN, MAX_VALUELEN};
pub use server::{ServerConfig, ServerExitReason, ServerHandle, DEFAULT_MAX_CONNECTIONS};
