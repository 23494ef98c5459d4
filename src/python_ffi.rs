// Python extensions for existing types

use pyo3::exceptions::{PyConnectionAbortedError, PyException, PyIOError, PyInterruptedError, PyUnicodeError, PyValueError};
use pyo3::prelude::*;

use crate::exec_env::EchoExecutor;
use crate::worker::Supervisor;
use crate::Error;

// Define mapping between the crate custom Error variants and Python
// exceptions
impl From<Error> for PyErr {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => PyIOError::new_err(e.to_string()),
            Error::CorruptHeader { got, expected } => {
                PyValueError::new_err(format!("corrupt header: got 0x{got:04x}, expected 0x{expected:04x}"))
            }
            Error::BodyTooLarge { len, max } => {
                PyValueError::new_err(format!("body too large: {len} bytes exceeds {max} byte limit"))
            }
            Error::TransportClosed => PyConnectionAbortedError::new_err("transport closed"),
            Error::Interrupted => PyInterruptedError::new_err("interrupted"),
            Error::BodyDecode(e) => PyValueError::new_err(e.to_string()),
            Error::BodyEncode(e) => PyValueError::new_err(e.to_string()),
            Error::Utf8(e) => PyUnicodeError::new_err(e.to_string()),
            Error::Other(s) => PyException::new_err(s),
        }
    }
}

/// Runs a worker supervisor against the standard child-fd pair (§6), using
/// the echo executor. Blocks the calling thread until shutdown. Exposed so
/// a Python-hosted manager can embed the worker loop directly instead of
/// spawning a separate `cellnode-worker` process.
#[pyfunction]
fn run_worker(read_fd: i32, write_fd: i32) -> PyResult<()> {
    let supervisor = Supervisor::from_raw_fds(read_fd, write_fd, EchoExecutor)?;
    supervisor.run_forever();
    Ok(())
}

pub(crate) fn register_pyo3(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_worker, m)?)?;
    Ok(())
}
