//! IPC module - Everything that crosses the controller/executor boundary.
//!
//! - `protocol`: tagged request/response schema
//! - `transport`: blocking request channel (in-process or Unix socket)
//! - `blob`: process-keyed side-channel and persistent stores
//! - `cancel`: cooperative cancellation tokens

pub mod blob;
pub mod cancel;
pub mod protocol;
pub mod transport;

pub use blob::{BlobError, BlobKind, BlobStore};
pub use cancel::CancellationToken;
pub use protocol::{Envelope, ExaminedExpression, Failure, Payload, Request, Response};
pub use transport::{channel, Endpoint, Transport, TransportError};
