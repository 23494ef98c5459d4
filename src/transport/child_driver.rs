//! The manager-side child driver (C9): spawns a worker with the fixed
//! child-fd mapping (§6, [`crate::config::child_fd`]), feeds its outbound
//! message pipe through a streaming decoder, and exposes a send queue for
//! manager-originated messages. Reads off the outbound pipe with a
//! nonblocking poll-then-read loop that tolerates short reads and
//! `WouldBlock`/`Interrupted` rather than blocking forever in one `read`.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::config::{child_fd, ChildDriverBuilder, Ready, READ_CHUNK_SIZE};
use crate::wire::message::MessageDecoder;
use crate::wire::DecodedMessage;
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

static REGISTERED_PIDS: Mutex<Vec<i32>> = Mutex::new(Vec::new());
static INSTALL_ATEXIT: Once = Once::new();

/// Registers `pid` to be SIGKILLed if the manager process exits without
/// tearing its worker down cleanly first. Idempotent installation of the
/// `atexit` hook itself; safe to call once per spawned worker.
pub(crate) fn register_kill_on_exit(pid: u32) {
    INSTALL_ATEXIT.call_once(|| unsafe {
        libc::atexit(kill_all_registered);
    });
    REGISTERED_PIDS.lock().unwrap().push(pid as i32);
}

/// Removes `pid` from the kill-on-exit set. Called once the driver has
/// observed (or initiated) a clean worker exit.
pub(crate) fn unregister_kill_on_exit(pid: u32) {
    REGISTERED_PIDS.lock().unwrap().retain(|&p| p != pid as i32);
}

extern "C" fn kill_all_registered() {
    if let Ok(pids) = REGISTERED_PIDS.lock() {
        for &pid in pids.iter() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

pub(crate) fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
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

/// Spawns and supervises one worker process from the manager side. Owns the
/// child's stdin/stdout/stderr handles (plain logging, per §4.7) and drives
/// the framed message pipes via its own receive/send thread pair.
pub struct ChildDriver {
    child: Child,
    shutdown: Arc<AtomicBool>,
    recv_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<()>>,
}

impl ChildDriver {
    /// Spawns the worker binary described by `builder`, wires up fds 3/4 per
    /// [`crate::config::child_fd`], and starts the message IO threads.
    /// `send_rx` feeds manager-originated messages to fd 3; `on_message` is
    /// invoked for each message decoded off fd 4.
    pub fn spawn(
        builder: ChildDriverBuilder<Ready>,
        send_rx: Receiver<DecodedMessage>,
        mut on_message: impl FnMut(DecodedMessage) + Send + 'static,
    ) -> Result<Self> {
        let (msg_in_read, msg_in_write) = make_pipe()?;
        let (msg_out_read, msg_out_write) = make_pipe()?;
        set_cloexec(msg_in_write)?;
        set_cloexec(msg_out_read)?;

        let mut cmd = Command::new(builder.program());
        cmd.args(builder.args());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(msg_in_read, child_fd::MSG_IN) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(msg_out_write, child_fd::MSG_OUT) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(msg_in_read);
                libc::close(msg_out_write);
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        unsafe {
            libc::close(msg_in_read);
            libc::close(msg_out_write);
        }
        register_kill_on_exit(child.id());
        set_nonblocking(msg_out_read)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let recv_shutdown = shutdown.clone();
        let recv_handle = std::thread::Builder::new()
            .name("cellnode-driver-recv".into())
            .spawn(move || {
                let mut file = unsafe { File::from_raw_fd(msg_out_read) };
                let mut decoder = MessageDecoder::new();
                let mut buf = [0u8; READ_CHUNK_SIZE];
                'outer: loop {
                    if recv_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match wait_readable(msg_out_read) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(_) => break,
                    }
                    loop {
                        match file.read(&mut buf) {
                            Ok(0) => break 'outer,
                            Ok(n) => match decoder.feed(Bytes::copy_from_slice(&buf[..n])) {
                                Ok(messages) => messages.into_iter().for_each(&mut on_message),
                                Err(_) => break 'outer,
                            },
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(_) => break 'outer,
                        }
                    }
                }
            })
            .expect("failed to spawn child-driver receive thread");

        let send_handle = std::thread::Builder::new()
            .name("cellnode-driver-send".into())
            .spawn(move || {
                let mut file = unsafe { File::from_raw_fd(msg_in_write) };
                while let Ok(mut m) = send_rx.recv() {
                    let Ok(bytes) = m.encode() else { continue };
                    if write_all(&mut file, &bytes).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn child-driver send thread");

        Ok(Self {
            child,
            shutdown,
            recv_handle: Some(recv_handle),
            send_handle: Some(send_handle),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// SIGKILLs the worker immediately.
    pub fn kill(&mut self) -> Result<()> {
        self.child.kill().map_err(Error::Io)
    }

    /// Waits for the worker to exit and tears down the driver's own IO
    /// threads and kill-on-exit registration.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait()?;
        unregister_kill_on_exit(self.child.id());
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.recv_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.send_handle.take() {
            let _ = h.join();
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_unregisters_without_duplicate_entries() {
        register_kill_on_exit(424242);
        register_kill_on_exit(424242);
        assert!(REGISTERED_PIDS.lock().unwrap().iter().filter(|&&p| p == 424242).count() >= 2);
        unregister_kill_on_exit(424242);
        assert!(!REGISTERED_PIDS.lock().unwrap().contains(&424242));
    }
}
