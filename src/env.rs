use crate::command::Level;
use crate::config::ShellConfig;
use crate::io_adapters::SessionIo;
use crate::jobs::JobRegistry;
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;
use thiserror::Error;

/// A named session variable, e.g. `$HOME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// Errors returned by [`Variables`] when the caller picked the wrong operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariableError {
    #[error("variable `{0}` is already defined")]
    AlreadyDefined(String),
    #[error("variable `{0}` is not defined")]
    Undefined(String),
}

/// Session variable store.
///
/// Names are matched exactly and case-sensitively. The store enforces only
/// that [`Variables::add`] never overwrites and [`Variables::set`] never
/// creates; choosing between the two is up to the caller.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    vars: HashMap<String, Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `$HOME`, `$PWD` and `$USER` from the process environment.
    pub fn from_process() -> Self {
        let mut vars = Self::new();
        let home = stdenv::var("HOME")
            .or_else(|_| stdenv::var("USERPROFILE"))
            .unwrap_or_else(|_| "/".to_string());
        let pwd = stdenv::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| ".".to_string());
        vars.assign("$HOME", home);
        vars.assign("$PWD", pwd);
        vars.assign("$USER", session_owner());
        vars
    }

    pub fn exists(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Value of `name`, if defined.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|v| v.value.as_str())
    }

    /// Overwrite an existing variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), VariableError> {
        match self.vars.get_mut(name) {
            Some(var) => {
                var.value = value.into();
                Ok(())
            }
            None => Err(VariableError::Undefined(name.to_string())),
        }
    }

    /// Insert a new variable.
    pub fn add(&mut self, name: &str, value: impl Into<String>) -> Result<(), VariableError> {
        if self.exists(name) {
            return Err(VariableError::AlreadyDefined(name.to_string()));
        }
        self.vars.insert(
            name.to_string(),
            Variable {
                name: name.to_string(),
                value: value.into(),
            },
        );
        Ok(())
    }

    /// Add the variable, or update it when it already exists.
    pub fn assign(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if self.exists(name) {
            let _ = self.set(name, value);
        } else {
            let _ = self.add(name, value);
        }
    }

    /// Replace every `$name` token that names a defined variable with its value.
    ///
    /// Unknown names are left untouched.
    pub fn substitute(&self, argv: &[String]) -> Vec<String> {
        argv.iter().map(|token| self.expand(token)).collect()
    }

    /// Value of `token` when it names a defined variable, else the token itself.
    pub fn expand(&self, token: &str) -> String {
        match token.starts_with('$') {
            true => self.value(token).unwrap_or(token).to_string(),
            false => token.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Name of the user owning this session, used as the owner of background jobs.
pub fn session_owner() -> String {
    stdenv::var("USER")
        .or_else(|_| stdenv::var("USERNAME"))
        .unwrap_or_else(|_| "flux".to_string())
}

/// Everything the dispatcher needs to know about the running session.
///
/// Fields are public like the rest of the session plumbing; the session loop
/// is the only writer of `variables` and `current_dir`.
pub struct Environment {
    /// Session variables, e.g. `$HOME` and `$PWD`.
    pub variables: Variables,
    /// Background jobs started from this session.
    pub jobs: JobRegistry,
    /// Owner recorded on jobs started from this session.
    pub owner: String,
    /// Streams handlers are bound to unless redirected.
    pub io: SessionIo,
    /// The working directory relative paths are resolved against.
    pub current_dir: PathBuf,
    /// Where `fail_safe` writes crash reports.
    pub crash_dir: PathBuf,
    /// Threshold for handler messages.
    pub verbosity: Level,
    /// Set by `exit`; the session loop stops when it is true.
    pub should_exit: bool,
}

impl Environment {
    /// Capture the current process state into a new session environment.
    pub fn new(config: &ShellConfig, io: SessionIo) -> Self {
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            variables: Variables::from_process(),
            jobs: JobRegistry::new(config.job_grace),
            owner: session_owner(),
            io,
            current_dir,
            crash_dir: config.crash_dir.clone(),
            verbosity: config.verbosity,
            should_exit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_get() {
        let mut vars = Variables::new();
        assert!(!vars.exists("$NAME"));
        vars.add("$NAME", "value").unwrap();
        assert!(vars.exists("$NAME"));
        assert_eq!(vars.get("$NAME").unwrap().value, "value");
        assert_eq!(vars.get("$NAME").unwrap().name, "$NAME");
    }

    #[test]
    fn test_add_twice_is_rejected() {
        let mut vars = Variables::new();
        vars.add("$A", "1").unwrap();
        assert_eq!(
            vars.add("$A", "2"),
            Err(VariableError::AlreadyDefined("$A".to_string()))
        );
        assert_eq!(vars.value("$A"), Some("1"));
    }

    #[test]
    fn test_set_requires_existing_key() {
        let mut vars = Variables::new();
        assert_eq!(
            vars.set("$MISSING", "x"),
            Err(VariableError::Undefined("$MISSING".to_string()))
        );
        assert!(!vars.exists("$MISSING"));

        vars.add("$A", "1").unwrap();
        vars.set("$A", "2").unwrap();
        assert_eq!(vars.value("$A"), Some("2"));
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let mut vars = Variables::new();
        vars.add("$home", "lower").unwrap();
        assert!(!vars.exists("$HOME"));
        vars.add("$HOME", "upper").unwrap();
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_substitute_known_names_only() {
        let mut vars = Variables::new();
        vars.assign("$DIR", "/tmp");
        let argv = vec!["ls".to_string(), "$DIR".to_string(), "$NOPE".to_string()];
        assert_eq!(vars.substitute(&argv), vec!["ls", "/tmp", "$NOPE"]);
    }

    #[test]
    fn test_from_process_seeds_session_variables() {
        let vars = Variables::from_process();
        assert!(vars.exists("$HOME"));
        assert!(vars.exists("$PWD"));
        assert!(vars.exists("$USER"));
    }
}
