//! End-to-end exercises of the worker supervisor over real pipe fds,
//! covering the six worked scenarios from §8: write framed requests into
//! one pipe, read framed replies out of the other, all against a
//! `Supervisor` running on its own thread.

use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::{Duration, Instant};

use cellnode::exec_env::{CellContext, CellExecutor, CellFailure, CellResult, EchoExecutor};
use cellnode::wire::document::DocBuilder;
use cellnode::wire::message::MessageDecoder;
use cellnode::wire::types::raw;
use cellnode::wire::{DecodedMessage, Document};
use cellnode::worker::Supervisor;

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn wait_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as i32) };
    n > 0
}

/// Reads and decodes messages from `fd` until at least `want` have arrived
/// or `timeout` elapses. Never blocks past the deadline.
fn read_messages(fd: RawFd, want: usize, timeout: Duration) -> Vec<DecodedMessage> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut decoder = MessageDecoder::new();
    let mut out = Vec::new();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    while out.len() < want && Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !wait_readable(fd, remaining.min(Duration::from_millis(50))) {
            continue;
        }
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend(decoder.feed(bytes::Bytes::copy_from_slice(&buf[..n])).unwrap()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        }
    }
    std::mem::forget(file); // the pipe fd is owned by the test harness, not this helper
    out
}

fn send(fd: RawFd, mut msg: DecodedMessage) {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.write_all(&msg.encode().unwrap()).unwrap();
    std::mem::forget(file);
}

struct Harness {
    to_worker: RawFd,
    from_worker: RawFd,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn spawn(executor: impl CellExecutor + 'static) -> Self {
        let (manager_write_read, manager_write_write) = pipe_pair();
        let (worker_out_read, worker_out_write) = pipe_pair();
        let supervisor = Supervisor::from_raw_fds(manager_write_read, worker_out_write, executor).unwrap();
        let handle = std::thread::spawn(move || supervisor.run_forever());
        Self {
            to_worker: manager_write_write,
            from_worker: worker_out_read,
            handle: Some(handle),
        }
    }

    fn shutdown_and_join(&mut self, timeout: Duration) {
        send(self.to_worker, DecodedMessage::new(raw::SHUTDOWN, Document::empty_doc()));
        let handle = self.handle.take().expect("already joined");
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            handle.join().unwrap();
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(timeout).is_ok(),
            "worker did not exit within {timeout:?} of Shutdown"
        );
    }
}

#[test]
fn shutdown_exits_within_a_second() {
    let mut h = Harness::spawn(EchoExecutor);
    h.shutdown_and_join(Duration::from_secs(1));
    // The worker forwards the Shutdown it received back out, but nothing
    // else — no Done, no Yes/No, no cell output follows it.
    let msgs = read_messages(h.from_worker, 1, Duration::from_millis(200));
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].r#type(), raw::SHUTDOWN);
}

#[test]
fn is_computing_replies_no_while_idle_within_250ms() {
    let mut h = Harness::spawn(EchoExecutor);
    send(h.to_worker, DecodedMessage::new(raw::IS_COMPUTING, Document::empty_doc()));
    let msgs = read_messages(h.from_worker, 1, Duration::from_millis(250));
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].r#type(), raw::NO);
    h.shutdown_and_join(Duration::from_secs(1));
}

struct TwoLineExecutor;
impl CellExecutor for TwoLineExecutor {
    fn execute(&mut self, ctx: &mut CellContext<'_>) -> CellResult {
        ctx.stdout.write_str("Hello ");
        ctx.stdout.write_str("World");
        Ok(())
    }
}

#[test]
fn exec_cell_hello_world_emits_ordered_stdout_then_done() {
    let mut h = Harness::spawn(TwoLineExecutor);
    let doc = DocBuilder::new().field("source", "print('Hello World')").build();
    let mut req = DecodedMessage::new(raw::EXEC_CELL, doc);
    req.header.sid = 42;
    send(h.to_worker, req);

    let msgs = read_messages(h.from_worker, 3, Duration::from_secs(1));
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[0].r#type(), raw::STDOUT);
    assert_eq!(msgs[0].header.sid, 42);
    assert_eq!(msgs[1].r#type(), raw::STDOUT);
    assert_eq!(msgs[2].r#type(), raw::DONE);
    assert_eq!(msgs[2].header.sid, 42);

    h.shutdown_and_join(Duration::from_secs(1));
}

struct RaisingExecutor;
impl CellExecutor for RaisingExecutor {
    fn execute(&mut self, _ctx: &mut CellContext<'_>) -> CellResult {
        Err(CellFailure {
            traceback: "Traceback (most recent call last):\nZeroDivisionError: division by zero".to_string(),
            etype: "ZeroDivisionError".to_string(),
            value: "division by zero".to_string(),
            syntax: None,
        })
    }
}

#[test]
fn exec_cell_exception_with_except_msg_emits_except_then_done() {
    let mut h = Harness::spawn(RaisingExecutor);
    let doc = DocBuilder::new().field("source", "1 / 0").field("except_msg", true).build();
    let mut req = DecodedMessage::new(raw::EXEC_CELL, doc);
    req.header.sid = 7;
    send(h.to_worker, req);

    let mut msgs = read_messages(h.from_worker, 2, Duration::from_secs(1));
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].r#type(), raw::EXCEPT);
    assert_eq!(msgs[0].get("etype").unwrap().unwrap().as_str(), Some("ZeroDivisionError"));
    assert_eq!(msgs[0].get("value").unwrap().unwrap().as_str(), Some("division by zero"));
    assert!(!msgs[0].get("stack").unwrap().unwrap().as_str().unwrap().is_empty());
    assert_eq!(msgs[1].r#type(), raw::DONE);

    h.shutdown_and_join(Duration::from_secs(1));
}

struct ReadingExecutor;
impl CellExecutor for ReadingExecutor {
    fn execute(&mut self, ctx: &mut CellContext<'_>) -> CellResult {
        let got = ctx.stdin.read(5).expect("stdin read should not be interrupted");
        ctx.stdout.write_bytes(got);
        Ok(())
    }
}

#[test]
fn exec_cell_reading_stdin_emits_need_stdin_then_echoes_after_reply() {
    let mut h = Harness::spawn(ReadingExecutor);
    let doc = DocBuilder::new().field("source", "input()").field("echo_stdin", true).build();
    let mut req = DecodedMessage::new(raw::EXEC_CELL, doc);
    req.header.sid = 3;
    send(h.to_worker, req);

    let need = read_messages(h.from_worker, 1, Duration::from_secs(1));
    assert_eq!(need.len(), 1);
    assert_eq!(need[0].r#type(), raw::NEED_STDIN);
    assert_eq!(need[0].header.sid, 3);

    let mut stdin_reply = DecodedMessage::new(raw::STDIN, DocBuilder::new().field("bytes", Document::Bytes(b"abcde".to_vec())).build());
    stdin_reply.header.sid = 3;
    send(h.to_worker, stdin_reply);

    // Echoed Stdin, the cell's own Stdout of what it read, then Done.
    let rest = read_messages(h.from_worker, 3, Duration::from_secs(1));
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].r#type(), raw::STDIN);
    assert_eq!(rest[1].r#type(), raw::STDOUT);
    assert_eq!(rest[2].r#type(), raw::DONE);

    h.shutdown_and_join(Duration::from_secs(1));
}

struct LoopingExecutor;
impl CellExecutor for LoopingExecutor {
    fn execute(&mut self, ctx: &mut CellContext<'_>) -> CellResult {
        loop {
            ctx.globals.sleep(Duration::from_millis(20));
            if ctx.globals.interrupt_flag().is_set() {
                return Ok(());
            }
        }
    }
}

#[test]
fn exec_cell_infinite_loop_is_interrupted_within_retries_times_poll_for() {
    let mut h = Harness::spawn(LoopingExecutor);
    let doc = DocBuilder::new().field("source", "while True: pass").build();
    let mut req = DecodedMessage::new(raw::EXEC_CELL, doc);
    req.header.sid = 9;
    send(h.to_worker, req);

    // Give the main thread a moment to start running the cell before we
    // interrupt it.
    std::thread::sleep(Duration::from_millis(50));

    let retries: i64 = 3;
    let poll_for_secs = 0.2;
    let interrupt_doc = DocBuilder::new().field("retries", retries).field("poll_for", poll_for_secs).build();
    send(h.to_worker, DecodedMessage::new(raw::INTERRUPT, interrupt_doc));

    // `Done` is queued by the main thread the instant the executor returns,
    // strictly before the receive thread's poll notices `main_receiving`
    // flip back to true and replies `Yes` — so `Done` is always first.
    let budget = Duration::from_secs_f64(retries as f64 * poll_for_secs) + Duration::from_secs(1);
    let msgs = read_messages(h.from_worker, 2, budget);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].r#type(), raw::DONE);
    assert_eq!(msgs[1].r#type(), raw::YES);

    h.shutdown_and_join(Duration::from_secs(1));
}
