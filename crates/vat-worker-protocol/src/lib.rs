//! Framed request/response protocol spoken between the vat runtime and a vat
//! worker process.
//!
//! Every frame is a 4-byte little-endian length followed by a canonical CBOR
//! array whose first element is a text tag. The runtime sends
//! [`ManagerRequest`]s; while a request is in flight the worker may send any
//! number of [`WorkerUpcall`]s before its final [`WorkerReply`].

mod channel;
mod error;
pub mod frame;
mod launcher;
mod message;

pub use channel::{RejectSyscalls, UpcallHandler, WorkerChannel};
pub use error::ProtocolError;
pub use launcher::{SubprocessLauncher, WORKER_PATH_ENV, WorkerLauncher};
pub use message::{FromWorker, ManagerRequest, ToWorker, WorkerReply, WorkerUpcall};

pub type ProtocolResult<T> = Result<T, ProtocolError>;
