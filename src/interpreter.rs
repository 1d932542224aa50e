use crate::command::{ExitCode, STATUS_ERR, STATUS_OK};
use crate::config::ShellConfig;
use crate::dispatch::Dispatcher;
use crate::env::Environment;
use crate::io_adapters::SessionIo;
use crate::lexer::{self, strip_quotes};
use crate::messages;
use anyhow::{Context, Result, anyhow, bail};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fmt::Display;
use std::fs;
use std::io::Write;
use tracing::{debug, info};

/// Commands handled by the interpreter itself, since they change the session.
const SESSION_BUILTINS: [(&str, &str); 4] = [
    ("cd", "change the working directory"),
    ("clear", "clear the terminal screen"),
    ("exit", "leave the shell with an optional status"),
    ("help", "list available commands"),
];

/// Result of one attempt to read a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// Ctrl-D on an empty line.
    EndOfInput,
    /// Ctrl-C; only the pending read is abandoned.
    Interrupted,
}

/// Whether the session goes on after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(ExitCode),
}

/// Read one line from the editor.
pub fn read_line(editor: &mut DefaultEditor, prompt: &str) -> Result<ReadOutcome> {
    match editor.readline(prompt) {
        Ok(line) => Ok(ReadOutcome::Line(line)),
        Err(ReadlineError::Interrupted) => Ok(ReadOutcome::Interrupted),
        Err(ReadlineError::Eof) => Ok(ReadOutcome::EndOfInput),
        Err(err) => Err(anyhow!("failed to read input: {err}")),
    }
}

/// The interactive shell: session state, the command table and the read loop.
///
/// ```no_run
/// use flux_shell::Interpreter;
/// use flux_shell::config::ShellConfig;
/// use flux_shell::dispatch::Dispatcher;
/// use flux_shell::io_adapters::SessionIo;
///
/// let mut sh = Interpreter::new(ShellConfig::default(), Dispatcher::default(), SessionIo::terminal());
/// let code = sh.repl().unwrap();
/// std::process::exit(code);
/// ```
pub struct Interpreter {
    env: Environment,
    dispatcher: Dispatcher,
    config: ShellConfig,
    last_status: ExitCode,
}

impl Interpreter {
    pub fn new(config: ShellConfig, dispatcher: Dispatcher, io: SessionIo) -> Self {
        Self {
            env: Environment::new(&config, io),
            dispatcher,
            config,
            last_status: STATUS_OK,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Status of the last command that ran.
    pub fn last_status(&self) -> ExitCode {
        self.last_status
    }

    pub fn prompt(&self) -> String {
        format!(
            "{} flux [{}] {} $ ",
            self.env.owner,
            env!("CARGO_PKG_VERSION"),
            self.env.current_dir.display()
        )
    }

    /// Execute every command of `line`, left to right.
    pub fn run_line(&mut self, line: &str) -> Flow {
        for argv in lexer::split_commands(line) {
            let status = match argv[0].as_str() {
                "exit" => match self.exit_code(&argv) {
                    Some(code) => {
                        self.env.should_exit = true;
                        return Flow::Exit(code);
                    }
                    None => STATUS_ERR,
                },
                "cd" => match self.change_dir(&argv) {
                    Ok(()) => STATUS_OK,
                    Err(e) => {
                        self.shell_error(format!("cd: {e:#}"));
                        STATUS_ERR
                    }
                },
                "clear" => {
                    let _ = write!(self.env.io.stdout.writer(), "\x1b[2J\x1b[H");
                    STATUS_OK
                }
                "help" => self.help(),
                _ => self.dispatcher.dispatch_one(&argv, &mut self.env).status(),
            };
            self.last_status = status;
        }
        Flow::Continue
    }

    /// Read and execute lines until `exit` or end of input.
    pub fn repl(&mut self) -> Result<ExitCode> {
        let mut editor =
            DefaultEditor::new().map_err(|e| anyhow!("cannot open the terminal: {e}"))?;

        let code = loop {
            match read_line(&mut editor, &self.prompt())? {
                ReadOutcome::Line(line) => {
                    if self.config.history && !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                    }
                    if let Flow::Exit(code) = self.run_line(&line) {
                        break code;
                    }
                }
                ReadOutcome::Interrupted => debug!("read interrupted"),
                ReadOutcome::EndOfInput => break self.last_status,
            }
        };

        self.env.jobs.clean();
        if !self.env.jobs.is_empty() {
            info!(running = self.env.jobs.len(), "leaving with jobs still running");
        }
        Ok(code)
    }

    fn shell_error(&self, msg: impl Display) {
        let _ = writeln!(self.env.io.stderr.writer(), "-flux: {msg}");
    }

    fn exit_code(&self, argv: &[String]) -> Option<ExitCode> {
        match argv.get(1) {
            None => Some(STATUS_OK),
            Some(arg) => match arg.parse::<ExitCode>() {
                Ok(code) => Some(code),
                Err(_) => {
                    self.shell_error(format!("exit: {arg}: numeric argument required"));
                    None
                }
            },
        }
    }

    fn change_dir(&mut self, argv: &[String]) -> Result<()> {
        if argv.len() > 2 {
            bail!(messages::too_many_args());
        }

        let target = match argv.get(1).map(|arg| strip_quotes(arg)) {
            Some(var) if var.starts_with('$') => self
                .env
                .variables
                .value(var)
                .with_context(|| format!("{var}: undefined variable"))?
                .to_string(),
            Some(path) => path.to_string(),
            None => self
                .env
                .variables
                .value("$HOME")
                .context("HOME not set")?
                .to_string(),
        };

        let new_dir = self.env.current_dir.join(&target);
        let canonical =
            fs::canonicalize(&new_dir).map_err(|e| anyhow!(messages::for_io_error(&target, &e)))?;
        if !canonical.is_dir() {
            bail!(messages::not_a_dir(&target));
        }

        std::env::set_current_dir(&canonical)
            .with_context(|| format!("can't chdir to {}", canonical.display()))?;
        debug!(dir = %canonical.display(), "changed directory");
        self.env
            .variables
            .assign("$PWD", canonical.display().to_string());
        self.env.current_dir = canonical;
        Ok(())
    }

    fn help(&self) -> ExitCode {
        let mut entries: Vec<(&str, &str)> = self
            .dispatcher
            .descriptors()
            .into_iter()
            .map(|d| (d.name, d.about))
            .chain(SESSION_BUILTINS)
            .collect();
        entries.sort();

        let mut out = self.env.io.stdout.writer();
        let _ = writeln!(out, "Available commands:");
        for (name, about) in entries {
            let _ = writeln!(out, "  {name:<8} {about}");
        }
        let _ = writeln!(out, "Run `<command> --help` for details.");
        STATUS_OK
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(
            ShellConfig::default(),
            Dispatcher::default(),
            SessionIo::terminal(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_adapters::MemWriter;
    use std::env as stdenv;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use std::time::Duration;

    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn shell() -> (Interpreter, MemWriter, MemWriter) {
        let (io, out, err) = SessionIo::captured(b"");
        let config = ShellConfig {
            job_grace: Duration::from_millis(5),
            crash_dir: stdenv::temp_dir().join("flux-test-crash"),
            ..ShellConfig::default()
        };
        (Interpreter::new(config, Dispatcher::default(), io), out, err)
    }

    /// Restores the process working directory when dropped.
    struct CwdGuard(PathBuf);

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = stdenv::set_current_dir(&self.0);
        }
    }

    #[test]
    fn test_exit_codes() {
        let (mut sh, _, _) = shell();
        assert_eq!(sh.run_line("exit"), Flow::Exit(0));
        assert_eq!(sh.run_line("EXIT 3"), Flow::Exit(3));
        assert!(sh.env().should_exit);

        let (mut sh, _, err) = shell();
        assert_eq!(sh.run_line("exit abc"), Flow::Continue);
        assert_eq!(sh.last_status(), STATUS_ERR);
        assert!(!sh.env().should_exit);
        assert_eq!(err.contents(), "-flux: exit: abc: numeric argument required\n");
    }

    #[test]
    fn test_exit_stops_the_rest_of_the_line() {
        let (mut sh, out, _) = shell();
        assert_eq!(sh.run_line("echo a; exit 4; echo b"), Flow::Exit(4));
        assert_eq!(out.contents(), "a\n");
    }

    #[test]
    fn test_last_status_follows_commands() {
        let (mut sh, _, err) = shell();
        assert_eq!(sh.run_line("missing"), Flow::Continue);
        assert_eq!(sh.last_status(), 127);
        assert_eq!(err.contents(), "-flux: missing: command not found\n");
        sh.run_line("echo ok");
        assert_eq!(sh.last_status(), STATUS_OK);
    }

    #[test]
    fn test_cd_to_absolute_path() {
        let _lock = lock_current_dir();
        let _restore = CwdGuard(stdenv::current_dir().unwrap());
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();

        let (mut sh, out, _) = shell();
        sh.run_line(&format!("cd {}", canonical_temp.display()));

        assert_eq!(sh.last_status(), STATUS_OK);
        assert_eq!(fs::canonicalize(stdenv::current_dir().unwrap()).unwrap(), canonical_temp);
        assert_eq!(sh.env().current_dir, canonical_temp);
        let pwd = canonical_temp.display().to_string();
        assert_eq!(sh.env().variables.value("$PWD"), Some(pwd.as_str()));

        sh.run_line("pwd");
        assert_eq!(out.contents(), format!("{pwd}\n"));
    }

    #[test]
    fn test_cd_relative_and_quoted() {
        let _lock = lock_current_dir();
        let _restore = CwdGuard(stdenv::current_dir().unwrap());
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();
        fs::create_dir(canonical_temp.join("sub")).unwrap();

        let (mut sh, _, _) = shell();
        sh.env_mut().current_dir = canonical_temp.clone();
        sh.run_line("cd \"sub\"");
        assert_eq!(sh.env().current_dir, canonical_temp.join("sub"));
        sh.run_line("cd ..");
        assert_eq!(sh.env().current_dir, canonical_temp);
    }

    #[test]
    fn test_cd_to_home_when_none() {
        let _lock = lock_current_dir();
        let _restore = CwdGuard(stdenv::current_dir().unwrap());
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();

        let (mut sh, _, _) = shell();
        sh.env_mut()
            .variables
            .assign("$HOME", canonical_temp.display().to_string());
        sh.run_line("cd");

        assert_eq!(sh.last_status(), STATUS_OK);
        assert_eq!(sh.env().current_dir, canonical_temp);
    }

    #[test]
    fn test_cd_to_variable() {
        let _lock = lock_current_dir();
        let _restore = CwdGuard(stdenv::current_dir().unwrap());
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();

        let (mut sh, _, _) = shell();
        sh.run_line(&format!("export $proj {}", canonical_temp.display()));
        sh.run_line("cd $proj");
        assert_eq!(sh.env().current_dir, canonical_temp);
    }

    #[test]
    fn test_cd_errors_leave_cwd_alone() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("plain.txt");
        fs::write(&file, "").unwrap();

        let (mut sh, _, err) = shell();
        let before = sh.env().current_dir.clone();

        sh.run_line("cd nonexistent_dir_for_flux_test");
        assert_eq!(sh.last_status(), STATUS_ERR);
        sh.run_line(&format!("cd {}", file.display()));
        sh.run_line("cd a b");
        sh.run_line("cd $nowhere");

        assert_eq!(sh.env().current_dir, before);
        assert_eq!(stdenv::current_dir().unwrap(), orig);
        let err = err.contents();
        assert!(err.contains(
            "-flux: cd: cannot open `nonexistent_dir_for_flux_test` (No such file or directory)"
        ));
        assert!(err.contains(": Not a directory"));
        assert!(err.contains("-flux: cd: too many arguments"));
        assert!(err.contains("-flux: cd: $nowhere: undefined variable"));
    }

    #[test]
    fn test_help_lists_every_command() {
        let (mut sh, out, _) = shell();
        sh.run_line("help");
        let text = out.contents();
        for name in ["cat", "cd", "clear", "echo", "exit", "export", "grep", "help", "jobs"] {
            assert!(text.contains(&format!("  {name:<8} ")), "{name} missing from help");
        }
    }

    #[test]
    fn test_prompt_shows_owner_version_and_dir() {
        let (sh, _, _) = shell();
        let prompt = sh.prompt();
        assert!(prompt.starts_with(&sh.env().owner));
        assert!(prompt.contains(&format!("flux [{}]", env!("CARGO_PKG_VERSION"))));
        assert!(prompt.ends_with(" $ "));
    }

    #[test]
    fn test_background_job_shows_in_jobs() {
        let (mut sh, out, _) = shell();
        sh.run_line("sleep 0.3 &");
        sh.run_line("jobs -l");
        let text = out.contents();
        assert!(text.starts_with("[1] sleep\n"));
        assert!(text.contains("\tsleep\t"));
        assert!(text.contains("Running\tsleep 0.3"));
        sh.env().jobs.remove(1).unwrap().wait();
    }
}
