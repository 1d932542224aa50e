//! The command lifecycle every handler goes through.
//!
//! A handler implements [`Command`]. The dispatcher pairs it with a
//! [`CommandContext`] (argument vector, bound streams, status) and drives the
//! pair with [`Invocation::drive`]:
//!
//! ```text
//! init -> setup -> run -> close -> exit
//!              \-> (abort requested) -> close -> exit
//! ```
//!
//! An error returned from, or a panic raised in, `init`, `setup`, `run` or
//! `close` is a fault: the normal path stops and [`Command::fail_safe`] is
//! called instead of `close` and `exit`.

use crate::crash;
use crate::jobs::JobInfo;
use crate::lexer::ArgumentVector;
use anyhow::Result;
use std::any::Any;
use std::fmt::Display;
use std::io::{self, BufRead, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
pub type ExitCode = i32;

/// The command completed successfully.
pub const STATUS_OK: ExitCode = 0;
/// Generic handler error.
pub const STATUS_ERR: ExitCode = 1;
/// The command completed but reported warnings.
pub const STATUS_WARN: ExitCode = 2;
/// The command name did not resolve to any handler.
pub const STATUS_NOT_FOUND: ExitCode = 127;

/// Message severities, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    #[default]
    NotSet = 0,
    Debug = 10,
    Info = 20,
    Warning = 30,
    Error = 40,
    Critical = 50,
}

impl Level {
    /// `FATAL` is the same severity as `CRITICAL`.
    pub const FATAL: Level = Level::Critical;
    pub const WARN: Level = Level::Warning;
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notset" | "0" => Ok(Level::NotSet),
            "debug" | "10" => Ok(Level::Debug),
            "info" | "20" => Ok(Level::Info),
            "warning" | "warn" | "30" => Ok(Level::Warning),
            "error" | "40" => Ok(Level::Error),
            "critical" | "fatal" | "50" => Ok(Level::Critical),
            other => Err(format!("unknown level `{other}`")),
        }
    }
}

/// Something that escaped the normal lifecycle.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("{0:#}")]
    Error(anyhow::Error),
    #[error("panicked: {0}")]
    Panic(String),
}

impl Fault {
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::Error(_) => "error",
            Fault::Panic(_) => "panic",
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Fault::Panic(message)
    }
}

/// Writer that stands in for a released stream.
struct Closed;

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed")
}

impl Write for Closed {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(closed_error())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for Closed {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(closed_error())
    }
}

impl BufRead for Closed {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Err(closed_error())
    }

    fn consume(&mut self, _amt: usize) {}
}

/// A stream bound to a handler. Owned streams (files opened for a
/// redirection) are dropped on release; borrowed ones are only flushed.
struct Bound<T: ?Sized> {
    stream: Box<T>,
    owned: bool,
}

/// Per-invocation state shared by all lifecycle stages.
pub struct CommandContext {
    argv: ArgumentVector,
    stdin: Bound<dyn BufRead + Send>,
    stdout: Bound<dyn Write + Send>,
    stderr: Bound<dyn Write + Send>,
    status: Option<ExitCode>,
    abort: bool,
    log_level: Level,
    current_dir: PathBuf,
    crash_dir: PathBuf,
    jobs: Vec<JobInfo>,
    exports: Vec<(String, String)>,
}

impl CommandContext {
    /// A context bound to the process' standard streams, with an empty stdin.
    pub fn new(argv: ArgumentVector) -> Self {
        Self {
            argv,
            stdin: Bound {
                stream: Box::new(io::empty()),
                owned: false,
            },
            stdout: Bound {
                stream: Box::new(io::stdout()),
                owned: false,
            },
            stderr: Bound {
                stream: Box::new(io::stderr()),
                owned: false,
            },
            status: None,
            abort: false,
            log_level: Level::NotSet,
            current_dir: PathBuf::from("."),
            crash_dir: std::env::temp_dir().join("flux-crash"),
            jobs: Vec::new(),
            exports: Vec::new(),
        }
    }

    /// Bind stdin. `owned` streams are dropped by [`CommandContext::release_streams`].
    pub fn with_stdin(mut self, stream: Box<dyn BufRead + Send>, owned: bool) -> Self {
        self.stdin = Bound { stream, owned };
        self
    }

    pub fn with_stdout(mut self, stream: Box<dyn Write + Send>, owned: bool) -> Self {
        self.stdout = Bound { stream, owned };
        self
    }

    pub fn with_stderr(mut self, stream: Box<dyn Write + Send>, owned: bool) -> Self {
        self.stderr = Bound { stream, owned };
        self
    }

    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = dir.into();
        self
    }

    pub fn with_crash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = dir.into();
        self
    }

    /// Snapshot of the session's jobs, for handlers that report on them.
    pub fn with_jobs(mut self, jobs: Vec<JobInfo>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn argv(&self) -> &ArgumentVector {
        &self.argv
    }

    /// Program name used as the prefix of error messages.
    pub fn prog(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("flux")
    }

    pub fn status(&self) -> Option<ExitCode> {
        self.status
    }

    pub fn set_status(&mut self, status: ExitCode) {
        self.status = Some(status);
    }

    /// Ask the driver to skip `run()` after `setup()` returns.
    pub fn abort(&mut self) {
        self.abort = true;
    }

    pub fn abort_requested(&self) -> bool {
        self.abort
    }

    pub fn log_level(&self) -> Level {
        self.log_level
    }

    pub fn set_log_level(&mut self, level: Level) {
        self.log_level = level;
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    /// Resolve `path` against the session's working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.current_dir.join(path)
    }

    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    pub fn jobs(&self) -> &[JobInfo] {
        &self.jobs
    }

    /// Queue a variable assignment for the session.
    ///
    /// Applied by the dispatcher once a foreground command finishes; ignored
    /// for background jobs.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.exports.push((name.into(), value.into()));
    }

    pub fn stdin(&mut self) -> &mut dyn BufRead {
        self.stdin.stream.as_mut()
    }

    pub fn stdout(&mut self) -> &mut dyn Write {
        self.stdout.stream.as_mut()
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        self.stderr.stream.as_mut()
    }

    /// Write `msg` and a newline to stdout.
    pub fn print(&mut self, msg: impl Display) -> io::Result<()> {
        writeln!(self.stdout.stream, "{msg}")
    }

    /// Write `msg` and a newline to stderr.
    pub fn printerr(&mut self, msg: impl Display) -> io::Result<()> {
        writeln!(self.stderr.stream, "{msg}")
    }

    /// Read one line from stdin, `None` at end of input.
    pub fn input(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        match self.stdin.stream.read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }

    fn enabled(&self, level: Level) -> bool {
        self.log_level <= level
    }

    fn report_error(&mut self, level: Level, msg: impl Display) -> io::Result<()> {
        self.status = Some(STATUS_ERR);
        if self.enabled(level) {
            let prog = self.prog().to_string();
            writeln!(self.stderr.stream, "{prog}: {msg}")?;
        }
        Ok(())
    }

    /// Report a critical error on stderr and set the error status.
    pub fn critical(&mut self, msg: impl Display) -> io::Result<()> {
        self.report_error(Level::Critical, msg)
    }

    pub fn fatal(&mut self, msg: impl Display) -> io::Result<()> {
        self.report_error(Level::FATAL, msg)
    }

    /// Report an error on stderr and set the error status.
    pub fn error(&mut self, msg: impl Display) -> io::Result<()> {
        self.report_error(Level::Error, msg)
    }

    /// Report a warning on stdout and set the warning status.
    pub fn warning(&mut self, msg: impl Display) -> io::Result<()> {
        self.status = Some(STATUS_WARN);
        if self.enabled(Level::Warning) {
            self.print(msg)?;
        }
        Ok(())
    }

    pub fn info(&mut self, msg: impl Display) -> io::Result<()> {
        if self.enabled(Level::Info) {
            self.print(msg)?;
        }
        Ok(())
    }

    pub fn debug(&mut self, msg: impl Display) -> io::Result<()> {
        if self.enabled(Level::Debug) {
            self.print(msg)?;
        }
        Ok(())
    }

    /// Flush all streams and drop the owned ones.
    ///
    /// Every stream is attempted; the first error is returned.
    pub fn release_streams(&mut self) -> io::Result<()> {
        let out = self.stdout.stream.flush();
        let err = self.stderr.stream.flush();
        if self.stdin.owned {
            self.stdin = Bound {
                stream: Box::new(Closed),
                owned: false,
            };
        }
        if self.stdout.owned {
            self.stdout = Bound {
                stream: Box::new(Closed),
                owned: false,
            };
        }
        if self.stderr.owned {
            self.stderr = Bound {
                stream: Box::new(Closed),
                owned: false,
            };
        }
        out.and(err)
    }

    fn take_exports(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.exports)
    }
}

/// The lifecycle contract implemented by every handler.
///
/// Only [`Command::run`] is required. The defaults make `setup` accept
/// anything, `close` release the owned streams, `exit` report the status
/// set by the handler (success when unset), and `fail_safe` write a crash
/// report.
pub trait Command: Send {
    /// Allocate handler-local state. Must not touch shared state.
    fn init(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        Ok(())
    }

    /// Validate `ctx.argv()`. On failure set the error status and call
    /// [`CommandContext::abort`].
    fn setup(&mut self, _ctx: &mut CommandContext) -> Result<()> {
        Ok(())
    }

    /// Perform the command's effect.
    fn run(&mut self, ctx: &mut CommandContext) -> Result<()>;

    /// Release resources. Runs after `run`, and after an abort from `setup`.
    fn close(&mut self, ctx: &mut CommandContext) -> Result<()> {
        ctx.release_streams()?;
        Ok(())
    }

    /// Final status of the command.
    fn exit(&mut self, ctx: &CommandContext) -> ExitCode {
        ctx.status().unwrap_or(STATUS_OK)
    }

    /// Called instead of `close` and `exit` when a fault escapes a stage.
    fn fail_safe(&mut self, ctx: &mut CommandContext, fault: &Fault) {
        report_fault(ctx, fault);
    }
}

/// Default fault handling: crash report, error status, best-effort release.
pub fn report_fault(ctx: &mut CommandContext, fault: &Fault) {
    ctx.set_status(STATUS_ERR);
    let written = crash::write_report(ctx.crash_dir(), ctx.prog(), ctx.argv(), fault);
    let _ = ctx.printerr(format!(
        "An error occurred while trying to execute command ({})",
        fault.kind()
    ));
    match written {
        Ok(path) => {
            let _ = ctx.printerr(format!(
                "The full error log can be found here: \n{}\n",
                path.display()
            ));
        }
        Err(e) => error!(command = ctx.prog(), "failed to write crash report: {e}"),
    }
    if let Err(e) = ctx.release_streams() {
        warn!(command = ctx.prog(), "failed to release streams: {e}");
    }
}

/// Static metadata about a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// The lower-case command name.
    pub name: &'static str,
    /// One-line summary shown by `help`.
    pub about: &'static str,
}

/// Creates fresh handler instances for one command name.
pub trait CommandFactory: Send + Sync {
    fn descriptor(&self) -> Descriptor;

    fn create(&self) -> Box<dyn Command>;

    /// How many operands after the name are passed on without variable
    /// substitution.
    fn literal_operands(&self) -> usize {
        0
    }
}

/// What [`Invocation::drive`] reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ExitCode,
    /// Variable assignments the handler asked for.
    pub exports: Vec<(String, String)>,
}

/// A handler paired with its context, ready to be driven once.
pub struct Invocation {
    handler: Box<dyn Command>,
    ctx: CommandContext,
}

fn run_stages(handler: &mut dyn Command, ctx: &mut CommandContext) -> Result<ExitCode> {
    trace!(command = ctx.prog(), "init");
    handler.init(ctx)?;
    trace!(command = ctx.prog(), "setup");
    handler.setup(ctx)?;

    if ctx.abort_requested() {
        debug!(command = ctx.prog(), "setup requested abort");
        handler.close(ctx)?;
        return Ok(handler.exit(ctx));
    }

    trace!(command = ctx.prog(), "run");
    handler.run(ctx)?;
    trace!(command = ctx.prog(), "close");
    handler.close(ctx)?;
    Ok(handler.exit(ctx))
}

impl Invocation {
    pub fn new(handler: Box<dyn Command>, ctx: CommandContext) -> Self {
        Self { handler, ctx }
    }

    pub fn argv(&self) -> &ArgumentVector {
        self.ctx.argv()
    }

    /// Run the whole lifecycle inside the fault boundary.
    pub fn drive(self) -> Outcome {
        let Invocation {
            mut handler,
            mut ctx,
        } = self;

        let staged = panic::catch_unwind(AssertUnwindSafe(|| {
            run_stages(handler.as_mut(), &mut ctx)
        }));

        let fault = match staged {
            Ok(Ok(status)) => {
                debug!(command = ctx.prog(), status, "command finished");
                return Outcome {
                    status,
                    exports: ctx.take_exports(),
                };
            }
            Ok(Err(err)) => Fault::Error(err),
            Err(payload) => Fault::from_panic(payload),
        };

        warn!(command = ctx.prog(), kind = fault.kind(), "command faulted: {fault}");
        let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.fail_safe(&mut ctx, &fault)));
        if handled.is_err() {
            error!(command = ctx.prog(), "fail_safe panicked");
            ctx.set_status(STATUS_ERR);
        }

        Outcome {
            status: ctx.status().unwrap_or(STATUS_ERR),
            exports: Vec::new(),
        }
    }
}
