//! Asynchronous interrupt of the main-compute thread (Design Notes: "in a
//! language without thread-level async interrupt, implement the
//! main-compute task as an OS thread ... using a platform signal as the
//! interrupt primitive"). Rust has no `thread.interrupt_main()` equivalent,
//! so this installs a no-op `SIGUSR1` handler once per process (so blocked
//! syscalls in the main thread return `EINTR` rather than the process
//! dying) and exposes `interrupt_thread` to deliver it via `pthread_kill`.
//!
//! An [`InterruptFlag`] is set alongside the signal so cooperative code
//! (the interruptible-sleep wrapper, a `CellExecutor` implementation) can
//! observe the interrupt even if it wasn't blocked in a signallable
//! syscall at the moment the signal arrived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::config::INTERRUPTIBLE_SLEEP_SLICE;

static INSTALL_HANDLER: Once = Once::new();

/// Installs a no-op handler for `SIGUSR1`. Idempotent; safe to call from
/// multiple threads. Must run before any thread relies on
/// `interrupt_thread` actually unblocking a syscall.
pub fn install_handler() {
    INSTALL_HANDLER.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = no_op_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        // Deliberately omit SA_RESTART: the point is that a blocking
        // syscall in the main thread returns EINTR instead of resuming.
        action.sa_flags = 0;
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
    });
}

extern "C" fn no_op_handler(_sig: libc::c_int) {}

/// Delivers `SIGUSR1` to the given native thread handle, interrupting a
/// blocking syscall it may be inside.
///
/// # Safety
/// `tid` must be a still-live `libc::pthread_t` obtained from the thread
/// being interrupted (e.g. via [`current_thread_handle`]).
pub unsafe fn interrupt_thread(tid: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(tid, libc::SIGUSR1);
    }
}

/// Returns a handle to the calling thread, for later use with
/// [`interrupt_thread`]. Call this from the main-compute thread itself at
/// startup and hand the result to the supervisor.
pub fn current_thread_handle() -> libc::pthread_t {
    unsafe { libc::pthread_self() }
}

/// Cooperative interrupt flag: set by the supervisor when it wants the
/// main-compute thread to unwind, cleared when a fresh cell execution
/// begins. Checked by [`interruptible_sleep`].
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Breaks a long sleep into `INTERRUPTIBLE_SLEEP_SLICE`-sized slices so a
/// pending interrupt lands within bounded time, per §4.5. Returns early
/// (before `total` elapses) if `flag` becomes set mid-sleep.
pub fn interruptible_sleep(total: Duration, flag: &InterruptFlag) {
    let mut remaining = total;
    while remaining > INTERRUPTIBLE_SLEEP_SLICE {
        if flag.is_set() {
            return;
        }
        std::thread::sleep(INTERRUPTIBLE_SLEEP_SLICE);
        remaining -= INTERRUPTIBLE_SLEEP_SLICE;
    }
    if flag.is_set() {
        return;
    }
    std::thread::sleep(remaining);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruptible_sleep_short_circuits_when_flag_is_set() {
        let flag = InterruptFlag::new();
        flag.set();
        let start = std::time::Instant::now();
        interruptible_sleep(Duration::from_secs(10), &flag);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn interrupt_flag_default_is_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_set());
    }
}
