//! Wire constants, default timeouts, and the type-state builder used to
//! spawn a worker from the manager side.
//!
//! The constant layout mirrors the well-known message-type table and header
//! layout (§3, §6); the builder is a type-state `Init -> Spawned` pattern.

use std::time::Duration;

/// Size in bytes of the encoded header: `type(2) + sid(2) + length(4) +
/// flags(1) + csum(2)`.
pub const HEADER_LEN: usize = 11;

/// Hard cap on a message body, in bytes (4 MiB).
pub const MAX_BODY_LEN: u32 = 4 * 1024 * 1024;

/// Chunk size the receive thread reads from the pipe at a time.
pub const READ_CHUNK_SIZE: usize = 4096;

/// `SOPEN` flag bit: this message opens a new stream.
pub const FLAG_SOPEN: u8 = 0x80;
/// `SCLOSE` flag bit: this message is the last one on its stream.
pub const FLAG_SCLOSE: u8 = 0x40;
/// Bits that must always be transmitted as zero.
pub const FLAG_RESERVED_MASK: u8 = !(FLAG_SOPEN | FLAG_SCLOSE);

/// Child fd map, from the manager's point of view: index is the fd number
/// in the child, value describes which end the manager holds.
pub mod child_fd {
    /// Worker's stdin: manager holds the write end.
    pub const STDIN: i32 = 0;
    /// Worker's stdout: manager holds the read end.
    pub const STDOUT: i32 = 1;
    /// Worker's stderr: manager holds the read end.
    pub const STDERR: i32 = 2;
    /// Inbound message pipe (manager -> worker): manager holds the write end.
    pub const MSG_IN: i32 = 3;
    /// Outbound message pipe (worker -> manager): manager holds the read end.
    pub const MSG_OUT: i32 = 4;
}

/// Default `Interrupt` retry count (§6 table: `retries?: int=2`).
pub const DEFAULT_INTERRUPT_RETRIES: u32 = 2;
/// Default `Interrupt` poll window (§6 table: `poll_for?: float=0.5`).
pub const DEFAULT_INTERRUPT_POLL_FOR: Duration = Duration::from_millis(500);
/// Default `Interrupt` overall timeout (§6 table: `timeout?: float=1.0`).
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default `Shutdown.before_int` (§6 table: `before_int?: float=0.5`).
pub const DEFAULT_SHUTDOWN_BEFORE_INT: Duration = Duration::from_millis(500);
/// Default `Shutdown.int_poll` (§6 table: `int_poll?: float=0.5`).
pub const DEFAULT_SHUTDOWN_INT_POLL: Duration = Duration::from_millis(500);
/// Default `Shutdown.int_retries` (§6 table: `int_retries?: int=1`).
pub const DEFAULT_SHUTDOWN_INT_RETRIES: u32 = 1;

/// Long sleeps inside the exec environment are sliced this fine so an
/// interrupt lands within bounded time (§4.5).
pub const INTERRUPTIBLE_SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Type-state marker: builder has not yet picked a spawn target.
pub struct Init;
/// Type-state marker: builder has a worker binary path and is ready to spawn.
pub struct Ready;

/// Type-state builder for the manager-side child driver: `Init` until a
/// worker binary is named, `Ready` to spawn after.
pub struct ChildDriverBuilder<State> {
    program: Option<String>,
    args: Vec<String>,
    _marker: std::marker::PhantomData<State>,
}

impl Default for ChildDriverBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildDriverBuilder<Init> {
    pub fn new() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Points the builder at the worker binary to spawn.
    pub fn with_program(self, program: impl Into<String>) -> ChildDriverBuilder<Ready> {
        ChildDriverBuilder {
            program: Some(program.into()),
            args: self.args,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<State> ChildDriverBuilder<State> {
    /// Appends an argument passed through to the worker binary.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl ChildDriverBuilder<Ready> {
    pub fn program(&self) -> &str {
        self.program.as_deref().expect("Ready state guarantees program is set")
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}
