//! A small interactive command shell.
//!
//! An input line is split into commands on `;` by the [`lexer`], each command
//! is resolved by name in the [`dispatch::Dispatcher`] and its handler is run
//! through the lifecycle described in [`command`]. A trailing `&` hands the
//! handler to the [`jobs::JobRegistry`] instead, which runs it on its own
//! thread.
//!
//! The main entry point is [`Interpreter`], which owns the session state and
//! the read loop. Handlers are plain Rust types: implement
//! [`builtin::Builtin`] for an argh-declared command, or
//! [`command::Command`] directly when the raw argument vector is needed.

pub mod builtin;
pub mod command;
pub mod config;
mod crash;
pub mod dispatch;
pub mod env;
mod interpreter;
pub mod io_adapters;
pub mod jobs;
pub mod lexer;
pub mod logging;
pub mod messages;
mod redirect;

/// Just a convenient re-export of the interactive shell.
///
/// See [`Interpreter`] for the high-level API.
pub use interpreter::{Flow, Interpreter, ReadOutcome};
