//! The worker supervisor (C8): hosts the receive/send/main threads, routes
//! inbound messages to a built-in handler, the exec environment's main
//! handler, or its receive handler, and drives the interrupt and shutdown
//! sequences. Grounded on
//! `sageserver/compnode/worker/worker.py`'s `Worker`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::{
    DEFAULT_INTERRUPT_POLL_FOR, DEFAULT_INTERRUPT_RETRIES, DEFAULT_SHUTDOWN_BEFORE_INT, DEFAULT_SHUTDOWN_INT_POLL,
    DEFAULT_SHUTDOWN_INT_RETRIES,
};
use crate::exec_env::{CellExecutor, CellIntrospector, ExecEnv, NullIntrospector};
use crate::interrupt;
use crate::transport::PipeTransport;
use crate::wire::types::raw;
use crate::wire::{Document, DecodedMessage};
use crate::Result;

/// Polls `predicate` every 10ms until it returns `true` or `timeout`
/// elapses. Returns whether it became true in time. Timeouts throughout this
/// module are driven by small-step polling rather than a per-blocking-call
/// deadline, so granularity is bounded by the poll interval rather than
/// exact.
fn poll_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    const STEP: Duration = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        if predicate() {
            return true;
        }
        if waited >= timeout {
            return false;
        }
        let step = STEP.min(timeout - waited);
        std::thread::sleep(step);
        waited += step;
    }
}

fn doc_f64(msg: &mut DecodedMessage, key: &str, default: f64) -> f64 {
    msg.get(key).ok().flatten().and_then(Document::as_f64).unwrap_or(default)
}

fn doc_i64(msg: &mut DecodedMessage, key: &str, default: i64) -> i64 {
    msg.get(key).ok().flatten().and_then(Document::as_i64).unwrap_or(default)
}

/// Shared supervisor state, reachable from both the receive thread (which
/// routes inbound messages) and the main thread (which owns the cell-exec
/// loop).
struct State {
    exec_env: Arc<ExecEnv>,
    send_tx: Sender<DecodedMessage>,
    main_tx: Sender<DecodedMessage>,
    shutdown: Mutex<Option<DecodedMessage>>,
    shutdown_called: AtomicBool,
    main_dead: AtomicBool,
    main_receiving: AtomicBool,
    main_thread: Mutex<Option<libc::pthread_t>>,
    transport: Mutex<Option<PipeTransport>>,
}

impl State {
    fn is_shutdown(&self) -> bool {
        self.shutdown.lock().unwrap().is_some()
    }

    /// Message routing (§4.6), performed by the receive thread on every
    /// completed inbound message.
    fn route_inbound(&self, msg: DecodedMessage) {
        match msg.r#type() {
            raw::SHUTDOWN | raw::INTERRUPT | raw::IS_COMPUTING => self.handle_builtin(msg),
            t if ExecEnv::is_main_handled(t) => {
                let _ = self.main_tx.send(msg);
            }
            t if ExecEnv::is_receive_handled(t) => match self.exec_env.handle_receive(msg) {
                Ok(Some(reply)) => {
                    let _ = self.send_tx.send(reply);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "receive-handler failed; dropping message"),
            },
            other => tracing::warn!(r#type = other, "unhandled message"),
        }
    }

    fn handle_builtin(&self, mut msg: DecodedMessage) {
        match msg.r#type() {
            raw::SHUTDOWN => self.initiate_shutdown(Some(msg)),
            raw::IS_COMPUTING => {
                let reply_type = if self.main_receiving.load(Ordering::SeqCst) {
                    raw::NO
                } else {
                    raw::YES
                };
                let reply = DecodedMessage::new(reply_type, Document::empty_doc()).as_reply_to(&msg);
                let _ = self.send_tx.send(reply);
            }
            raw::INTERRUPT => {
                let retries = doc_i64(&mut msg, "retries", DEFAULT_INTERRUPT_RETRIES as i64).max(0) as u32;
                let poll_for_secs = doc_f64(&mut msg, "poll_for", DEFAULT_INTERRUPT_POLL_FOR.as_secs_f64());
                let poll_window = Duration::from_secs_f64(poll_for_secs.max(0.0));
                let mut success = false;
                for _ in 0..retries {
                    if self.interrupt_main(poll_window) {
                        success = true;
                        break;
                    }
                }
                let reply_type = if success { raw::YES } else { raw::NO };
                let reply = DecodedMessage::new(reply_type, Document::empty_doc()).as_reply_to(&msg);
                let _ = self.send_tx.send(reply);
            }
            _ => unreachable!("handle_builtin only called for SHUTDOWN/IS_COMPUTING/INTERRUPT"),
        }
    }

    /// Implements the interrupt algorithm of §4.6: idle already, or cancel a
    /// blocked stdin read, or deliver an async signal to the main thread.
    fn interrupt_main(&self, poll_window: Duration) -> bool {
        if self.main_receiving.load(Ordering::SeqCst) {
            return true;
        }

        if self.exec_env.waiting_on_stdin() {
            self.exec_env.interrupt_stdin();
            if poll_for(poll_window, || self.main_receiving.load(Ordering::SeqCst)) {
                return true;
            }
        }

        if let Some(tid) = *self.main_thread.lock().unwrap() {
            unsafe { interrupt::interrupt_thread(tid) };
        }
        self.exec_env.interrupt_flag().set();
        poll_for(poll_window, || self.main_receiving.load(Ordering::SeqCst))
    }

    /// Idempotent shutdown sequence (§4.6). First invocation wins; later
    /// calls are no-ops, matching `shutdown_called`.
    fn initiate_shutdown(&self, msg: Option<DecodedMessage>) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }

        let sd = {
            let mut guard = self.shutdown.lock().unwrap();
            if guard.is_none() {
                *guard = Some(msg.unwrap_or_else(|| DecodedMessage::new(raw::SHUTDOWN, Document::empty_doc())));
            }
            guard.as_ref().unwrap().clone()
        };
        let mut sd_for_fields = sd.clone();

        let _ = self.send_tx.send(sd.clone());
        let _ = self.main_tx.send(sd);

        let before_int = Duration::from_secs_f64(doc_f64(
            &mut sd_for_fields,
            "before_int",
            DEFAULT_SHUTDOWN_BEFORE_INT.as_secs_f64(),
        ));
        let int_poll = Duration::from_secs_f64(doc_f64(
            &mut sd_for_fields,
            "int_poll",
            DEFAULT_SHUTDOWN_INT_POLL.as_secs_f64(),
        ));
        let int_retries = doc_i64(&mut sd_for_fields, "int_retries", DEFAULT_SHUTDOWN_INT_RETRIES as i64).max(0);

        if poll_for(before_int, || self.main_dead.load(Ordering::SeqCst)) {
            return;
        }

        for _ in 0..int_retries {
            self.interrupt_main(Duration::ZERO);
            if poll_for(int_poll, || self.main_dead.load(Ordering::SeqCst)) {
                return;
            }
        }

        // Last resort: runaway native code in the main thread. Give logs a
        // moment to flush, then self-SIGKILL.
        tracing::warn!("shutdown: main thread did not exit, committing suicide");
        std::thread::sleep(Duration::from_millis(100));
        unsafe {
            libc::kill(libc::getpid(), libc::SIGKILL);
        }
    }
}

/// Hosts the three worker threads (receive, send, main-compute) around one
/// fd pair. Construct with [`Supervisor::from_raw_fds`] and drive with
/// [`Supervisor::run_forever`], which blocks the calling thread — call it
/// from the process's actual main thread so the interrupt signal (§9) lands
/// where the manager expects user code to be running.
pub struct Supervisor {
    state: Arc<State>,
    main_rx: Receiver<DecodedMessage>,
}

impl Supervisor {
    /// Builds a supervisor with no real introspection backend wired in yet
    /// — used by the worker binary until a real language backend is
    /// available.
    pub fn from_raw_fds(read_fd: RawFd, write_fd: RawFd, executor: impl CellExecutor + 'static) -> Result<Self> {
        Self::new(read_fd, write_fd, Box::new(executor), Box::new(NullIntrospector))
    }

    pub fn new(
        read_fd: RawFd,
        write_fd: RawFd,
        executor: Box<dyn CellExecutor>,
        introspector: Box<dyn CellIntrospector>,
    ) -> Result<Self> {
        interrupt::install_handler();

        let exec_env = Arc::new(ExecEnv::new(executor, introspector));
        let (main_tx, main_rx) = crossbeam_channel::unbounded();
        let (send_tx, send_rx) = crossbeam_channel::unbounded();

        let state = Arc::new(State {
            exec_env,
            send_tx: send_tx.clone(),
            main_tx,
            shutdown: Mutex::new(None),
            shutdown_called: AtomicBool::new(false),
            main_dead: AtomicBool::new(false),
            main_receiving: AtomicBool::new(false),
            main_thread: Mutex::new(None),
            transport: Mutex::new(None),
        });

        let route_state = state.clone();
        let closed_state = state.clone();
        let transport = PipeTransport::spawn(
            read_fd,
            write_fd,
            send_rx,
            |t| matches!(t, raw::SHUTDOWN | raw::INTERRUPT | raw::IS_COMPUTING) || ExecEnv::is_main_handled(t) || ExecEnv::is_receive_handled(t),
            move |msg| route_state.route_inbound(msg),
            move || closed_state.initiate_shutdown(None),
        )?;
        *state.transport.lock().unwrap() = Some(transport);

        Ok(Self { state, main_rx })
    }

    /// Runs the main-compute loop on the calling thread until shutdown.
    /// Blocking: returns only once the worker has fully shut down.
    pub fn run_forever(self) {
        *self.state.main_thread.lock().unwrap() = Some(interrupt::current_thread_handle());

        loop {
            self.state.main_receiving.store(true, Ordering::SeqCst);
            let msg = match self.main_rx.recv() {
                Ok(m) => m,
                Err(_) => break,
            };
            self.state.main_receiving.store(false, Ordering::SeqCst);

            if msg.r#type() == raw::SHUTDOWN {
                break;
            }
            if ExecEnv::is_main_handled(msg.r#type()) {
                if let Err(e) = self.state.exec_env.run_exec_cell(msg, &self.state.send_tx) {
                    tracing::error!(error = %e, "cell execution failed");
                }
            } else {
                tracing::error!(r#type = msg.r#type(), "unhandled message in main thread");
            }
        }

        self.state.main_dead.store(true, Ordering::SeqCst);
        self.state.main_receiving.store(false, Ordering::SeqCst);
        self.state.initiate_shutdown(None);

        if let Some(transport) = self.state.transport.lock().unwrap().take() {
            transport.request_shutdown();
        }
    }
}

/// Convenience constructor matching the §6 child-fd map: the worker sees
/// `3` as the inbound-messages read fd and `4` as the outbound-messages
/// write fd.
pub fn standard_fds() -> (RawFd, RawFd) {
    (crate::config::child_fd::MSG_IN, crate::config::child_fd::MSG_OUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_env::EchoExecutor;
    use std::os::unix::io::FromRawFd;
    use std::io::{Read, Write};

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn is_computing_replies_no_while_idle() {
        let (manager_write_read, manager_write_write) = pipe_pair();
        let (worker_out_read, worker_out_write) = pipe_pair();

        let supervisor = Supervisor::from_raw_fds(manager_write_read, worker_out_write, EchoExecutor).unwrap();
        let handle = std::thread::spawn(move || supervisor.run_forever());

        let mut to_worker = unsafe { std::fs::File::from_raw_fd(manager_write_write) };
        let mut req = DecodedMessage::new(raw::IS_COMPUTING, Document::empty_doc());
        to_worker.write_all(&req.encode().unwrap()).unwrap();

        let mut from_worker = unsafe { std::fs::File::from_raw_fd(worker_out_read) };
        let mut buf = [0u8; 64];
        let n = from_worker.read(&mut buf).unwrap();
        let mut decoder = crate::wire::message::MessageDecoder::new();
        let msgs = decoder.feed(bytes::Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].r#type(), raw::NO);

        let mut shutdown = DecodedMessage::new(raw::SHUTDOWN, Document::empty_doc());
        to_worker.write_all(&shutdown.encode().unwrap()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_exits_the_main_loop() {
        let (manager_write_read, manager_write_write) = pipe_pair();
        let (worker_out_read, worker_out_write) = pipe_pair();

        let supervisor = Supervisor::from_raw_fds(manager_write_read, worker_out_write, EchoExecutor).unwrap();
        let handle = std::thread::spawn(move || supervisor.run_forever());

        let mut to_worker = unsafe { std::fs::File::from_raw_fd(manager_write_write) };
        let mut shutdown = DecodedMessage::new(raw::SHUTDOWN, Document::empty_doc());
        to_worker.write_all(&shutdown.encode().unwrap()).unwrap();

        handle.join().unwrap();
        drop(unsafe { std::fs::File::from_raw_fd(worker_out_read) });
    }
}
