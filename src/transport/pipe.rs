//! The worker-side pipe transport (C5): a receive thread bound to the
//! inbound-messages read fd and a send thread bound to the outbound-messages
//! write fd. The receive thread polls its fd nonblocking so it can also
//! recheck a shutdown flag between reads; the send thread blocks on the
//! queue and coalesces whatever else is immediately available into one
//! write, without ever starving a queued `SHUTDOWN`.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::config::READ_CHUNK_SIZE;
use crate::wire::message::CallbackDecoder;
use crate::wire::types::raw;
use crate::wire::DecodedMessage;
use crate::{Error, Result};

/// How often the receive thread's poll wakes up to recheck the shutdown
/// flag while no data is available.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Puts `fd` in non-blocking mode so the receive thread can poll it instead
/// of blocking forever in a single `read`.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Blocks up to `POLL_INTERVAL` for `fd` to become readable. Returns `true`
/// if it did, `false` on timeout.
fn wait_readable(fd: RawFd) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL.as_millis() as i32) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }
    Ok(n > 0)
}

fn write_all(file: &mut File, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => return Err(Error::TransportClosed),
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Owns the receive and send threads for one worker's message pipes. Each
/// fd is owned by exactly one thread, matching §5's resource model; both
/// fds are closed when the corresponding thread exits (via `File`'s `Drop`).
pub struct PipeTransport {
    shutdown: Arc<AtomicBool>,
    recv_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<()>>,
}

impl PipeTransport {
    /// Spawns the receive and send threads.
    ///
    /// * `is_known` classifies a message type as routable so unknown types
    ///   can be discarded without stalling the decoder (§4.2).
    /// * `on_message` is invoked, in order, for every completed inbound
    ///   message, from the receive thread.
    /// * `on_closed` runs once the receive thread observes EOF, a read
    ///   error, or a poisoned decoder — the supervisor's shutdown hook.
    ///
    /// `send_rx` is the consuming end of the shared send queue; any
    /// producer can hold the matching `Sender`.
    pub fn spawn(
        read_fd: RawFd,
        write_fd: RawFd,
        send_rx: Receiver<DecodedMessage>,
        is_known: impl Fn(u16) -> bool + Send + 'static,
        mut on_message: impl FnMut(DecodedMessage) + Send + 'static,
        on_closed: impl Fn() + Send + 'static,
    ) -> Result<Self> {
        set_nonblocking(read_fd)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let recv_shutdown = shutdown.clone();
        let recv_handle = std::thread::Builder::new()
            .name("cellnode-recv".into())
            .spawn(move || {
                let mut file = unsafe { File::from_raw_fd(read_fd) };
                let mut decoder = CallbackDecoder::new();
                let mut buf = [0u8; READ_CHUNK_SIZE];
                'outer: loop {
                    if recv_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match wait_readable(read_fd) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(_) => break,
                    }
                    loop {
                        match file.read(&mut buf) {
                            Ok(0) => break 'outer,
                            Ok(n) => {
                                if decoder
                                    .feed(Bytes::copy_from_slice(&buf[..n]), &is_known, &mut on_message)
                                    .is_err()
                                {
                                    break 'outer;
                                }
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(_) => break 'outer,
                        }
                    }
                }
                on_closed();
            })
            .expect("failed to spawn receive thread");

        let send_handle = std::thread::Builder::new()
            .name("cellnode-send".into())
            .spawn(move || {
                let mut file = unsafe { File::from_raw_fd(write_fd) };
                loop {
                    let first = match send_rx.recv() {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    let mut saw_shutdown = first.r#type() == raw::SHUTDOWN;
                    let mut batch = vec![first];
                    if !saw_shutdown {
                        // Coalesce whatever else is immediately available,
                        // but never let a queued SHUTDOWN wait behind it.
                        while let Ok(next) = send_rx.try_recv() {
                            let next_is_shutdown = next.r#type() == raw::SHUTDOWN;
                            batch.push(next);
                            if next_is_shutdown {
                                saw_shutdown = true;
                                break;
                            }
                        }
                    }
                    let mut out = Vec::new();
                    for mut m in batch {
                        match m.encode() {
                            Ok(bytes) => out.extend(bytes),
                            Err(_) => continue,
                        }
                    }
                    if write_all(&mut file, &out).is_err() {
                        break;
                    }
                    if saw_shutdown {
                        break;
                    }
                }
            })
            .expect("failed to spawn send thread");

        Ok(Self {
            shutdown,
            recv_handle: Some(recv_handle),
            send_handle: Some(send_handle),
        })
    }

    /// Signals the receive thread to exit at its next poll tick.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Waits for both threads to exit.
    pub fn join(mut self) {
        if let Some(h) = self.recv_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.send_handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::document::DocBuilder;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn feeds_decoded_messages_to_the_callback_in_order() {
        let (in_read, in_write) = pipe_pair();
        let (out_read, out_write) = pipe_pair();
        let (send_tx, send_rx) = crossbeam_channel::unbounded();

        let (received_tx, received_rx) = crossbeam_channel::unbounded();
        let transport = PipeTransport::spawn(
            in_read,
            out_write,
            send_rx,
            |_t| true,
            move |m| {
                let _ = received_tx.send(m.r#type());
            },
            || {},
        )
        .unwrap();

        let mut in_write_file = unsafe { File::from_raw_fd(in_write) };
        let mut m = DecodedMessage::new(raw::IS_COMPUTING, DocBuilder::new().build());
        in_write_file.write_all(&m.encode().unwrap()).unwrap();
        drop(in_write_file);

        let got = received_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, raw::IS_COMPUTING);

        let mut reply = DecodedMessage::new(raw::NO, DocBuilder::new().build());
        send_tx.send(reply.clone()).unwrap();
        send_tx
            .send(DecodedMessage::new(raw::SHUTDOWN, DocBuilder::new().build()))
            .unwrap();

        transport.join();

        let mut out_read_file = unsafe { File::from_raw_fd(out_read) };
        let mut buf = Vec::new();
        out_read_file.read_to_end(&mut buf).unwrap();
        let mut expected = reply.encode().unwrap();
        expected.extend(DecodedMessage::new(raw::SHUTDOWN, DocBuilder::new().build()).encode().unwrap());
        assert_eq!(buf, expected);
    }
}
