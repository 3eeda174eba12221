//! Core runtime for busard RPC: endpoints, transports, sessions, the
//! invocation engine, object adapters, reference tracking and streams.
//!
//! The wire format lives in `busard-flat`; the protocol constants in
//! `busard-protocol`; the embedder-facing facade in `busard`.

#![forbid(unsafe_op_in_unsafe_fn)]

mod config;
mod endpoint;
mod error;
mod invocation;
mod object;
mod poa;
mod runtime;
mod session;
mod stream;
mod transport;

pub use config::*;
pub use endpoint::*;
pub use error::*;
pub use invocation::*;
pub use object::*;
pub use poa::*;
pub use runtime::*;
pub use session::*;
pub use stream::*;
pub use transport::*;

// Re-export the identity types callers handle directly.
pub use busard_protocol::{ErrorKind, ObjectFlags, ObjectId};
