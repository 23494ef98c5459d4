//! Async flavor of the manager-side child driver (C9), behind the `async`
//! feature. Same framing and fd-mapping logic as [`super::child_driver`],
//! with tokio tasks standing in for the sync driver's OS threads, so a
//! tokio-hosted manager can drive several workers on one runtime instead of
//! dedicating two OS threads per worker.

use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt as _;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::child_driver::{make_pipe, register_kill_on_exit, set_cloexec, set_nonblocking, unregister_kill_on_exit};
use crate::config::{child_fd, ChildDriverBuilder, Ready, READ_CHUNK_SIZE};
use crate::wire::message::MessageDecoder;
use crate::wire::DecodedMessage;
use crate::{Error, Result};

/// Async manager-side driver for one worker process.
pub struct AsyncChildDriver {
    child: Child,
    recv_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<()>>,
}

impl AsyncChildDriver {
    pub async fn spawn(
        builder: ChildDriverBuilder<Ready>,
        mut send_rx: UnboundedReceiver<DecodedMessage>,
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
        register_kill_on_exit(child.id().unwrap_or(0));

        set_nonblocking(msg_out_read)?;
        set_nonblocking(msg_in_write)?;
        let mut msg_out =
            pipe::Receiver::from_file(unsafe { std::fs::File::from_raw_fd(msg_out_read) }).map_err(Error::Io)?;
        let mut msg_in =
            pipe::Sender::from_file(unsafe { std::fs::File::from_raw_fd(msg_in_write) }).map_err(Error::Io)?;

        let recv_handle = tokio::spawn(async move {
            let mut decoder = MessageDecoder::new();
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match msg_out.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => match decoder.feed(Bytes::copy_from_slice(&buf[..n])) {
                        Ok(messages) => messages.into_iter().for_each(&mut on_message),
                        Err(_) => break,
                    },
                    Err(_) => break,
                }
            }
        });

        let send_handle = tokio::spawn(async move {
            while let Some(mut m) = send_rx.recv().await {
                let Ok(bytes) = m.encode() else { continue };
                if msg_in.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            recv_handle: Some(recv_handle),
            send_handle: Some(send_handle),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(Error::Io)
    }

    /// Waits for the worker to exit and its IO tasks to drain.
    pub async fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if let Some(pid) = self.child.id() {
            unregister_kill_on_exit(pid);
        }
        if let Some(h) = self.recv_handle.take() {
            let _ = h.await;
        }
        if let Some(h) = self.send_handle.take() {
            let _ = h.await;
        }
        Ok(status)
    }
}
