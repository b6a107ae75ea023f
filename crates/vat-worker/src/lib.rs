//! Worker side of the vat supervisor protocol.
//!
//! A worker hosts exactly one vat. [`run_worker`] reads [`ManagerRequest`]
//! frames, drives the [`Supervisor`] state machine, and writes replies. The
//! same loop backs the `vat-worker` executable and the in-process launcher
//! used by tests and embedded runtimes.
//!
//! [`ManagerRequest`]: vat_worker_protocol::ManagerRequest

mod in_process;
pub mod program;
mod supervisor;

pub use in_process::InProcessLauncher;
pub use program::{DeliveryError, ProgramError, SyscallPort, VatProgram, WorkerSnapshot};
pub use supervisor::{DispatchState, Supervisor, run_worker};
