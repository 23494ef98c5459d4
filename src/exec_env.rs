//! The execution environment (C7): owns one worker's persistent globals and
//! runs one cell at a time on the main-compute thread. Grounded on
//! `sageserver/compnode/worker/exec_env.py`'s `ExecEnv`.
//!
//! The actual language backend — parsing, the AST/source transform pass,
//! compiling, running untrusted code, and introspecting a live namespace for
//! completions/docs/source — is explicitly out of scope (§1 "Out of
//! scope"). This module defines the seam a real backend plugs into
//! ([`CellExecutor`], [`CellIntrospector`]) and owns everything around it:
//! request parsing, adapter wiring, the `Except`/`Stderr`/`Done` finalizer,
//! and the receive-handler table for `Stdin`/`GetCompletions`/`GetDoc`/
//! `GetSource`.

use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::interrupt::InterruptFlag;
use crate::stdio::{OutputAdapter, StdinAdapter};
use crate::wire::document::DocBuilder;
use crate::wire::types::raw;
use crate::wire::{Document, DecodedMessage};
use crate::Result;

/// A persistent handle into the worker's cell globals. The real thing this
/// stands in for is a language runtime's global namespace; all this crate
/// needs from it is an interruptible sleep that a real `time.sleep`-style
/// binding would delegate to (§4.5).
#[derive(Clone)]
pub struct Globals {
    interrupt: InterruptFlag,
}

impl Globals {
    /// Sleeps for `dur`, sliced so a pending interrupt lands within bounded
    /// time.
    pub fn sleep(&self, dur: std::time::Duration) {
        crate::interrupt::interruptible_sleep(dur, &self.interrupt);
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }
}

/// `displayhook?: {LAST,ALL,NONE}` (§6). Unrecognized values fall back to
/// the default rather than erroring — the field only matters to the
/// external transform/executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayHook {
    Last,
    All,
    None,
}

impl DisplayHook {
    fn parse(s: &str) -> Self {
        match s {
            "ALL" => Self::All,
            "NONE" => Self::None,
            _ => Self::Last,
        }
    }
}

/// `assignhook?: {ALL,NONE}` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignHook {
    All,
    None,
}

impl AssignHook {
    fn parse(s: &str) -> Self {
        match s {
            "NONE" => Self::None,
            _ => Self::All,
        }
    }
}

/// A parsed `ExecCell` request (§6 body keys), defaults applied.
pub struct ExecCellRequest {
    pub source: String,
    pub cid: i64,
    pub echo_stdin: bool,
    pub displayhook: DisplayHook,
    pub assignhook: AssignHook,
    pub print_ast: bool,
    pub except_msg: bool,
}

impl ExecCellRequest {
    fn from_message(msg: &mut DecodedMessage) -> Result<Self> {
        let source = msg.get("source")?.and_then(Document::as_str).unwrap_or_default().to_string();
        let cid = msg.get("cid")?.and_then(Document::as_i64).unwrap_or(0);
        let echo_stdin = msg.get("echo_stdin")?.and_then(Document::as_bool).unwrap_or(true);
        let displayhook = msg
            .get("displayhook")?
            .and_then(Document::as_str)
            .map(DisplayHook::parse)
            .unwrap_or(DisplayHook::Last);
        let assignhook = msg
            .get("assignhook")?
            .and_then(Document::as_str)
            .map(AssignHook::parse)
            .unwrap_or(AssignHook::All);
        let print_ast = msg.get("print_ast")?.and_then(Document::as_bool).unwrap_or(false);
        let except_msg = msg.get("except_msg")?.and_then(Document::as_bool).unwrap_or(false);
        Ok(Self {
            source,
            cid,
            echo_stdin,
            displayhook,
            assignhook,
            print_ast,
            except_msg,
        })
    }
}

/// A user-code failure, as formatted at the `ExecCell` boundary. Mirrors
/// `_get_except_msg`'s fields exactly (§6 EXCEPT body keys).
#[derive(Debug, Clone)]
pub struct CellFailure {
    /// Full formatted traceback text.
    pub traceback: String,
    pub etype: String,
    pub value: String,
    /// Set only when the failure is a syntax error.
    pub syntax: Option<String>,
}

pub type CellResult = std::result::Result<(), CellFailure>;

/// Everything a [`CellExecutor`] needs to run one cell: the source text, the
/// rerouted standard streams, the cell's globals handle, and the request's
/// hook/AST options. The executor itself — parse, transform, compile, run —
/// is the external collaborator named in §1 as out of scope.
pub struct CellContext<'a> {
    pub source: &'a str,
    pub cid: i64,
    pub displayhook: DisplayHook,
    pub assignhook: AssignHook,
    pub print_ast: bool,
    pub stdout: &'a OutputAdapter,
    pub stderr: &'a OutputAdapter,
    pub stdin: &'a mut StdinAdapter,
    pub globals: &'a Globals,
}

/// The external language-backend seam (§1 "the code-cell executor backend
/// itself"). A real implementation parses `ctx.source`, applies the
/// out-of-scope AST transform, compiles and runs it against `ctx.globals`,
/// and reports the outcome.
pub trait CellExecutor: Send {
    fn execute(&mut self, ctx: &mut CellContext<'_>) -> CellResult;
}

/// The result of an introspection query: whether the named object was
/// found, and the requested text if so.
#[derive(Debug, Clone, Default)]
pub struct ObjectLookup {
    pub found: bool,
    pub text: Option<String>,
}

/// The external introspection seam (§1 "the introspection helpers"),
/// covering `GetCompletions`/`GetDoc`/`GetSource`.
pub trait CellIntrospector: Send + Sync {
    fn completions(&self, text: &str, format: &str) -> Vec<String>;
    fn doc(&self, object: &str, format: &str) -> ObjectLookup;
    fn source(&self, object: &str, format: &str) -> ObjectLookup;
}

/// An introspector that finds nothing. Used when a real backend hasn't been
/// wired in yet.
#[derive(Debug, Default)]
pub struct NullIntrospector;

impl CellIntrospector for NullIntrospector {
    fn completions(&self, _text: &str, _format: &str) -> Vec<String> {
        Vec::new()
    }

    fn doc(&self, _object: &str, _format: &str) -> ObjectLookup {
        ObjectLookup::default()
    }

    fn source(&self, _object: &str, _format: &str) -> ObjectLookup {
        ObjectLookup::default()
    }
}

/// A `CellExecutor` test double: writes the cell's source back out as
/// stdout, verbatim, and always succeeds. Stands in for a real language
/// backend in tests and in the worker binary until one is wired in.
#[derive(Debug, Default)]
pub struct EchoExecutor;

impl CellExecutor for EchoExecutor {
    fn execute(&mut self, ctx: &mut CellContext<'_>) -> CellResult {
        ctx.stdout.write_str(ctx.source);
        Ok(())
    }
}

/// Owns the receive-handler table (`Stdin`, `GetCompletions`, `GetDoc`,
/// `GetSource`) and the main-handler table (`ExecCell`). One instance per
/// worker, shared between the receive and main threads via `Arc`.
pub struct ExecEnv {
    executor: Mutex<Box<dyn CellExecutor>>,
    introspector: Box<dyn CellIntrospector>,
    interrupt: InterruptFlag,
    /// The active cell's stdin input queue, if a cell is currently running.
    /// The receive thread routes inbound `Stdin` into it; `None` means "no
    /// cell is waiting on stdin", matching `hasattr(self, '_stdin_q')`.
    active_stdin: Mutex<Option<Sender<DecodedMessage>>>,
}

impl ExecEnv {
    pub fn new(executor: Box<dyn CellExecutor>, introspector: Box<dyn CellIntrospector>) -> Self {
        Self {
            executor: Mutex::new(executor),
            introspector,
            interrupt: InterruptFlag::new(),
            active_stdin: Mutex::new(None),
        }
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Whether a cell is currently blocked reading stdin — used by the
    /// supervisor's interrupt algorithm (§4.6 step b).
    pub fn waiting_on_stdin(&self) -> bool {
        self.active_stdin.lock().unwrap().is_some()
    }

    /// Routes a pending `Interrupt` to the active cell's stdin queue, if
    /// one is waiting. Returns whether it did.
    pub fn interrupt_stdin(&self) -> bool {
        let guard = self.active_stdin.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(DecodedMessage::new(raw::INTERRUPT, Document::empty_doc()));
                true
            }
            None => false,
        }
    }

    pub fn is_main_handled(r#type: u16) -> bool {
        r#type == raw::EXEC_CELL
    }

    pub fn is_receive_handled(r#type: u16) -> bool {
        matches!(r#type, raw::STDIN | raw::GET_COMPLETIONS | raw::GET_DOC | raw::GET_SOURCE)
    }

    /// Invoked from the receive thread for types in the receive-handler
    /// table. Must not block and must not touch the cell globals (§4.5).
    pub fn handle_receive(&self, mut msg: DecodedMessage) -> Result<Option<DecodedMessage>> {
        match msg.r#type() {
            raw::STDIN => {
                let guard = self.active_stdin.lock().unwrap();
                match guard.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => tracing::warn!("unhandled Stdin: no cell is waiting on stdin"),
                }
                Ok(None)
            }
            raw::GET_COMPLETIONS => {
                let text = msg.get("text")?.and_then(Document::as_str).unwrap_or_default().to_string();
                let format = msg.get("format")?.and_then(Document::as_str).unwrap_or("TEXT").to_string();
                let completions = self.introspector.completions(&text, &format);
                let doc = DocBuilder::new()
                    .field("text", text)
                    .field("format", format)
                    .field(
                        "completions",
                        Document::List(completions.into_iter().map(Document::Str).collect()),
                    )
                    .build();
                Ok(Some(DecodedMessage::new(raw::COMPLETIONS, doc).as_reply_to(&msg)))
            }
            raw::GET_DOC => {
                let object = msg.get("object")?.and_then(Document::as_str).unwrap_or_default().to_string();
                let format = msg.get("format")?.and_then(Document::as_str).unwrap_or("TEXT").to_string();
                let lookup = self.introspector.doc(&object, &format);
                let mut builder = DocBuilder::new()
                    .field("object", object)
                    .field("format", format)
                    .field("obj_found", lookup.found);
                if let Some(doc_text) = lookup.text {
                    builder = builder.field("doc", doc_text);
                }
                Ok(Some(DecodedMessage::new(raw::DOC, builder.build()).as_reply_to(&msg)))
            }
            raw::GET_SOURCE => {
                let object = msg.get("object")?.and_then(Document::as_str).unwrap_or_default().to_string();
                let format = msg.get("format")?.and_then(Document::as_str).unwrap_or("TEXT").to_string();
                let lookup = self.introspector.source(&object, &format);
                let mut builder = DocBuilder::new()
                    .field("object", object)
                    .field("format", format)
                    .field("obj_found", lookup.found);
                if let Some(source_text) = lookup.text {
                    builder = builder.field("source", source_text);
                }
                Ok(Some(DecodedMessage::new(raw::SOURCE, builder.build()).as_reply_to(&msg)))
            }
            other => {
                tracing::warn!(r#type = other, "ExecEnv::handle_receive called for an unhandled type");
                Ok(None)
            }
        }
    }

    /// Runs one `ExecCell` request to completion on the calling thread
    /// (the main-compute thread). Always finishes by sending `Done` on
    /// `send_q`, even after a cell failure.
    pub fn run_exec_cell(&self, mut msg: DecodedMessage, send_q: &Sender<DecodedMessage>) -> Result<()> {
        let sid = msg.header.sid;
        let req = ExecCellRequest::from_message(&mut msg)?;

        self.interrupt.clear();
        let stdout = OutputAdapter::stdout(send_q.clone(), sid);
        let stderr = OutputAdapter::stderr(send_q.clone(), sid);
        let (stdin_tx, stdin_rx) = crossbeam_channel::unbounded();
        let mut stdin = StdinAdapter::new(send_q.clone(), stdin_rx, sid, req.echo_stdin);

        *self.active_stdin.lock().unwrap() = Some(stdin_tx);

        let globals = Globals {
            interrupt: self.interrupt.clone(),
        };
        let outcome = {
            let mut ctx = CellContext {
                source: &req.source,
                cid: req.cid,
                displayhook: req.displayhook,
                assignhook: req.assignhook,
                print_ast: req.print_ast,
                stdout: &stdout,
                stderr: &stderr,
                stdin: &mut stdin,
                globals: &globals,
            };
            let mut executor = self.executor.lock().unwrap();
            executor.execute(&mut ctx)
        };

        *self.active_stdin.lock().unwrap() = None;

        if let Err(failure) = outcome {
            let reply = render_failure(failure, req.except_msg, sid);
            let _ = send_q.send(reply);
        }

        let done = DecodedMessage::new(raw::DONE, Document::empty_doc()).as_reply_to(&msg);
        let _ = send_q.send(done);
        Ok(())
    }
}

/// Builds the `Except` or `Stderr` reply for a failed cell, per
/// `_get_except_msg`: structured `Except` when the request asked for it,
/// otherwise a plain `Stderr` carrying the traceback text.
fn render_failure(failure: CellFailure, except_msg: bool, sid: u16) -> DecodedMessage {
    let mut m = if except_msg {
        let mut builder = DocBuilder::new()
            .field("stderr", failure.traceback.clone())
            .field("stack", failure.traceback)
            .field("etype", failure.etype)
            .field("value", failure.value);
        if let Some(syntax) = failure.syntax {
            builder = builder.field("syntax", syntax);
        }
        DecodedMessage::new(raw::EXCEPT, builder.build())
    } else {
        let doc = DocBuilder::new()
            .field("bytes", Document::Bytes(failure.traceback.into_bytes()))
            .build();
        DecodedMessage::new(raw::STDERR, doc)
    };
    m.header.sid = sid;
    m
}
