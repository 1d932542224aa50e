//! Stream redirections and the background marker.
//!
//! The lexer leaves operators in the argument vector; before a handler is
//! built the dispatcher strips them out here and opens the files they name.

use crate::lexer::{ArgumentVector, Operator};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Token that requests background execution when it ends the command.
pub const BACKGROUND_MARKER: &str = "&";

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("syntax error near unexpected token `{0}'")]
    MissingTarget(String),
    #[error("pipes are not supported")]
    Pipe,
    #[error("{0}: bad file descriptor")]
    BadDescriptor(u8),
    #[error("missing command before redirection")]
    MissingCommand,
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// An output file and how to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Truncate(PathBuf),
    Append(PathBuf),
}

impl OutputTarget {
    fn new(path: &str, append: bool) -> Self {
        match append {
            true => OutputTarget::Append(PathBuf::from(path)),
            false => OutputTarget::Truncate(PathBuf::from(path)),
        }
    }

    /// Open the target relative to `cwd`.
    pub fn open(&self, cwd: &Path) -> Result<File, RedirectError> {
        let (path, append) = match self {
            OutputTarget::Truncate(p) => (p, false),
            OutputTarget::Append(p) => (p, true),
        };
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options.open(cwd.join(path)).map_err(|source| RedirectError::Open {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Open an input redirection target relative to `cwd`.
pub fn open_input(path: &Path, cwd: &Path) -> Result<File, RedirectError> {
    File::open(cwd.join(path)).map_err(|source| RedirectError::Open {
        path: path.display().to_string(),
        source,
    })
}

/// A command with its redirections separated out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// The command words, operators and targets removed.
    pub argv: ArgumentVector,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<OutputTarget>,
    pub stderr: Option<OutputTarget>,
    pub background: bool,
}

impl Plan {
    /// Rewrite every redirection target through `expand`.
    pub fn expand_targets(&mut self, expand: impl Fn(&str) -> String) {
        let rewrite = |path: &mut PathBuf| *path = PathBuf::from(expand(&path.to_string_lossy()));
        if let Some(path) = &mut self.stdin {
            rewrite(path);
        }
        for target in [&mut self.stdout, &mut self.stderr].into_iter().flatten() {
            match target {
                OutputTarget::Truncate(path) | OutputTarget::Append(path) => rewrite(path),
            }
        }
    }
}

/// Separate redirections and the background marker from the command words.
///
/// When the same stream is redirected twice the last redirection wins.
pub fn plan(mut argv: ArgumentVector) -> Result<Plan, RedirectError> {
    let mut plan = Plan::default();

    if let Some(last) = argv.last_mut() {
        if last.as_str() == BACKGROUND_MARKER {
            argv.pop();
            plan.background = true;
        } else if let Some(word) = last.strip_suffix(BACKGROUND_MARKER) {
            *last = word.to_string();
            plan.background = true;
        }
    }

    let mut tokens = argv.into_iter();
    while let Some(token) = tokens.next() {
        let Some(op) = Operator::parse(&token) else {
            plan.argv.push(token);
            continue;
        };

        if op == Operator::Pipe {
            return Err(RedirectError::Pipe);
        }

        let target = match tokens.next() {
            Some(t) if Operator::parse(&t).is_none() => t,
            Some(t) => return Err(RedirectError::MissingTarget(t)),
            None => return Err(RedirectError::MissingTarget("newline".to_string())),
        };

        match op {
            Operator::RedirectOut => plan.stdout = Some(OutputTarget::new(&target, false)),
            Operator::Append => plan.stdout = Some(OutputTarget::new(&target, true)),
            Operator::RedirectIn | Operator::HereIn => plan.stdin = Some(PathBuf::from(target)),
            Operator::Descriptor { fd: 1, append } => {
                plan.stdout = Some(OutputTarget::new(&target, append))
            }
            Operator::Descriptor { fd: 2, append } => {
                plan.stderr = Some(OutputTarget::new(&target, append))
            }
            Operator::Descriptor { fd, .. } => return Err(RedirectError::BadDescriptor(fd)),
            Operator::Separator | Operator::Pipe => {
                return Err(RedirectError::MissingTarget(op.to_string()));
            }
        }
    }

    if plan.argv.is_empty() {
        return Err(RedirectError::MissingCommand);
    }
    Ok(plan)
}
