//! Compute-node worker subsystem: a manager process spawns isolated worker
//! processes that execute untrusted code cells on its behalf. Manager and
//! worker talk exclusively over a pair of one-directional pipes using a
//! length-prefixed, checksummed binary message framing (see [`wire`]).
//!
//! The pieces that ship here:
//! * [`wire`] — the header codec, join-buffer, lazy message container and
//!   streaming decoder.
//! * [`transport`] — the pipe transport (worker side) and the manager-side
//!   child driver, sync and async flavors.
//! * [`stdio`] — stdout/stderr/stdin adapters that reroute a cell's standard
//!   streams through the message transport.
//! * [`exec_env`] — the per-worker execution environment: globals, the
//!   receive/main handler tables, and the `CellExecutor` seam a real
//!   language backend plugs into.
//! * [`worker`] — the three-thread supervisor: routing, interrupt, shutdown.
//! * [`interrupt`] — the asynchronous-interrupt primitive for the
//!   main-compute thread.
//!
//! # Example
//! Build a worker-side supervisor around a file-descriptor pair and a
//! [`exec_env::CellExecutor`], and run it until shutdown:
//!
//! ```no_run
//! use cellnode::worker::Supervisor;
//! use cellnode::exec_env::EchoExecutor;
//!
//! # fn example() -> cellnode::Result<()> {
//! let supervisor = Supervisor::from_raw_fds(3, 4, EchoExecutor::default())?;
//! supervisor.run_forever();
//! # Ok(())
//! # }
//! ```
use std::str::Utf8Error;

use thiserror::Error;

pub mod config;
pub mod exec_env;
pub mod interrupt;
pub mod stdio;
pub mod transport;
pub mod wire;
pub mod worker;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
mod python_ffi;

/// Errors produced by the transport, codec, and supervisor layers.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A decoded header's checksum did not match the transmitted one. The
    /// transport carrying it must be considered unrecoverable.
    #[error("corrupt header: got checksum 0x{got:04x}, expected 0x{expected:04x}")]
    CorruptHeader { got: u16, expected: u16 },
    /// A header declared a body longer than [`config::MAX_BODY_LEN`].
    #[error("body too large: {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: u32, max: u32 },
    /// The peer closed its end of the pipe, or a read/write failed.
    #[error("transport closed")]
    TransportClosed,
    /// A blocked `stdin.read` was cancelled by an inbound `Interrupt`.
    #[error("interrupted")]
    Interrupted,
    #[error("body decode error: {0}")]
    BodyDecode(#[from] rmp_serde::decode::Error),
    #[error("body encode error: {0}")]
    BodyEncode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "python")]
#[pymodule]
#[pyo3(name = "cellnode_python_ffi")]
fn py_module(py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
    python_ffi::register_pyo3(py, m)?;
    Ok(())
}
