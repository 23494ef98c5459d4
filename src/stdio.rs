//! Standard-stream adapters (C6) that reroute a cell's stdout/stderr/stdin
//! through the send queue / input queue instead of real file descriptors.
//! Grounded on `sageserver/compnode/worker/queuefile.py`'s
//! `QueueFileOut`/`QueueFileIn`.

use crossbeam_channel::{Receiver, Sender};

use crate::wire::document::DocBuilder;
use crate::wire::message::DecodedMessage;
use crate::wire::types::raw;
use crate::wire::JoinBuffer;
use crate::{Error, Result};

/// Builds a `Stdout`/`Stderr`-shaped message carrying `bytes`, tagged with
/// `sid`.
fn stream_message(r#type: u16, sid: u16, bytes: Vec<u8>) -> DecodedMessage {
    let doc = DocBuilder::new().field("bytes", crate::wire::Document::Bytes(bytes)).build();
    let mut m = DecodedMessage::new(r#type, doc);
    m.header.sid = sid;
    m
}

/// Replaces a cell's `sys.stdout` or `sys.stderr`: every `write` emits one
/// message on the send queue. `flush` is a no-op — the transport is the
/// only buffering. Encoding is always UTF-8; invalid sequences are replaced
/// (`String::from_utf8_lossy`).
#[derive(Debug, Clone)]
pub struct OutputAdapter {
    send_q: Sender<DecodedMessage>,
    message_type: u16,
    sid: u16,
}

impl OutputAdapter {
    pub fn stdout(send_q: Sender<DecodedMessage>, sid: u16) -> Self {
        Self {
            send_q,
            message_type: raw::STDOUT,
            sid,
        }
    }

    pub fn stderr(send_q: Sender<DecodedMessage>, sid: u16) -> Self {
        Self {
            send_q,
            message_type: raw::STDERR,
            sid,
        }
    }

    /// Writes a chunk of text, UTF-8 encoding with replacement on error.
    pub fn write_str(&self, s: &str) {
        self.write_bytes(s.as_bytes().to_vec());
    }

    /// Writes a chunk of raw bytes.
    pub fn write_bytes(&self, bytes: Vec<u8>) {
        let _ = self
            .send_q
            .send(stream_message(self.message_type, self.sid, bytes));
    }

    /// `writelines` is defined as `write(join(chunks))`: one message for
    /// the whole batch, not one per line.
    pub fn write_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: String = lines.into_iter().map(|l| l.as_ref().to_string()).collect();
        self.write_str(&joined);
    }

    /// No-op: the transport is the only buffering this adapter has.
    pub fn flush(&self) {}
}

/// Replaces a cell's `sys.stdin`. `read` consults an internal join-buffer;
/// if it comes up short, emits `NeedStdin(n)` (at most once per wait) and
/// blocks on the per-adapter input queue, fed by inbound `Stdin` and
/// `Interrupt` messages.
pub struct StdinAdapter {
    send_q: Sender<DecodedMessage>,
    input_q: Receiver<DecodedMessage>,
    sid: u16,
    echo_stdin: bool,
    jbuf: JoinBuffer,
    waiting: bool,
}

impl StdinAdapter {
    pub fn new(
        send_q: Sender<DecodedMessage>,
        input_q: Receiver<DecodedMessage>,
        sid: u16,
        echo_stdin: bool,
    ) -> Self {
        Self {
            send_q,
            input_q,
            sid,
            echo_stdin,
            jbuf: JoinBuffer::new(),
            waiting: false,
        }
    }

    /// True exactly while `read` is blocked on the input queue. The
    /// supervisor consults this to decide between interrupt strategies.
    pub fn waiting(&self) -> bool {
        self.waiting
    }

    /// `read(n)`: `n < 0` drains until EOF, `n == 0` returns empty without
    /// any transport traffic, `n > 0` reads up to `n` bytes (fewer only at
    /// EOF).
    pub fn read(&mut self, n: i64) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.waiting = true;
        let result = if n < 0 {
            self.read_until_eof()
        } else {
            self.read_n(n as usize)
        };
        self.waiting = false;
        result
    }

    fn read_until_eof(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.recv_stdin_chunk(usize::MAX)? {
                Some(chunk) if !chunk.is_empty() => self.jbuf.extend(chunk),
                _ => break,
            }
        }
        let out = self.jbuf.pop_all().to_vec();
        self.echo(&out, true);
        Ok(out)
    }

    fn read_n(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut was_eof = false;
        while self.jbuf.len() < n {
            match self.recv_stdin_chunk(n - self.jbuf.len())? {
                Some(chunk) if !chunk.is_empty() => self.jbuf.extend(chunk),
                _ => {
                    was_eof = true;
                    break;
                }
            }
        }
        let out = if was_eof {
            self.jbuf.pop_all().to_vec()
        } else {
            self.jbuf.pop_left(n).expect("loop invariant: jbuf has >= n bytes").to_vec()
        };
        self.echo(&out, was_eof);
        Ok(out)
    }

    /// Emits `NeedStdin(size)` if nothing is buffered in the input queue
    /// yet, then blocks for the next message. Returns `Ok(None)` on EOF
    /// (empty `Stdin` payload), `Ok(Some(bytes))` otherwise.
    fn recv_stdin_chunk(&mut self, size: usize) -> Result<Option<Vec<u8>>> {
        if self.input_q.is_empty() {
            let need_stdin = DecodedMessage::new(
                raw::NEED_STDIN,
                DocBuilder::new()
                    .field("nbytes", size.min(i64::MAX as usize) as i64)
                    .build(),
            );
            let mut need_stdin = need_stdin;
            need_stdin.header.sid = self.sid;
            let _ = self.send_q.send(need_stdin);
        }
        let mut m = match self.input_q.recv() {
            Ok(m) => m,
            Err(_) => return Ok(None), // sender dropped: treat as EOF
        };
        if m.r#type() == raw::INTERRUPT {
            return Err(Error::Interrupted);
        }
        if m.r#type() != raw::STDIN {
            return Ok(Some(Vec::new()));
        }
        let bytes = m
            .get("bytes")?
            .and_then(|d| d.as_bytes())
            .map(|b| b.to_vec())
            .unwrap_or_default();
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bytes))
        }
    }

    /// Echoes consumed bytes back as a `Stdin` message (so the manager can
    /// interleave them with stdout/stderr), plus a trailing empty `Stdin`
    /// on EOF. No-op when `echo_stdin` is false.
    fn echo(&self, bytes: &[u8], was_eof: bool) {
        if !self.echo_stdin {
            return;
        }
        let _ = self.send_q.send(stream_message(raw::STDIN, self.sid, bytes.to_vec()));
        if was_eof {
            let _ = self.send_q.send(stream_message(raw::STDIN, self.sid, Vec::new()));
        }
    }
}
