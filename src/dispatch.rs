//! Name resolution and execution of one command line.

use crate::builtin::{Cat, Echo, Export, Grep, Jobs, Pwd, Rmdir, Sleep, Wc};
use crate::command::{
    CommandContext, CommandFactory, Descriptor, ExitCode, Invocation, STATUS_ERR,
    STATUS_NOT_FOUND, STATUS_OK,
};
use crate::env::Environment;
use crate::io_adapters::Source;
use crate::jobs::JobId;
use crate::lexer::ArgumentVector;
use crate::redirect::{self, Plan, RedirectError};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{BufReader, Write};
use std::marker::PhantomData;
use tracing::{debug, info, warn};

/// Factory creating handlers for a command type defined in this crate.
pub struct Factory<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

/// What happened to one argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Ran in the foreground and finished with this status.
    Completed(ExitCode),
    /// Handed to the job registry.
    Background(JobId),
    /// No handler is registered under this name.
    NotFound(String),
    /// Never started, e.g. a bad redirection.
    Rejected(String),
}

impl Dispatched {
    pub fn status(&self) -> ExitCode {
        match self {
            Dispatched::Completed(code) => *code,
            Dispatched::Background(_) => STATUS_OK,
            Dispatched::NotFound(_) => STATUS_NOT_FOUND,
            Dispatched::Rejected(_) => STATUS_ERR,
        }
    }
}

/// Report a problem that belongs to the shell rather than to a handler.
fn shell_error(env: &Environment, msg: impl Display) {
    let _ = writeln!(env.io.stderr.writer(), "-flux: {msg}");
}

/// Bind the streams named by `plan`, falling back to the session's.
fn bind(plan: &Plan, env: &Environment) -> Result<CommandContext, RedirectError> {
    let cwd = &env.current_dir;
    let ctx = CommandContext::new(plan.argv.clone())
        .with_log_level(env.verbosity)
        .with_current_dir(cwd.clone())
        .with_crash_dir(env.crash_dir.clone())
        .with_jobs(env.jobs.list());

    let ctx = match &plan.stdin {
        Some(path) => ctx.with_stdin(
            Box::new(BufReader::new(redirect::open_input(path, cwd)?)),
            true,
        ),
        None if plan.background => ctx.with_stdin(Source::Empty.reader(), false),
        None => ctx.with_stdin(env.io.stdin.reader(), false),
    };
    let ctx = match &plan.stdout {
        Some(target) => ctx.with_stdout(Box::new(target.open(cwd)?), true),
        None => ctx.with_stdout(env.io.stdout.writer(), false),
    };
    let ctx = match &plan.stderr {
        Some(target) => ctx.with_stderr(Box::new(target.open(cwd)?), true),
        None => ctx.with_stderr(env.io.stderr.writer(), false),
    };
    Ok(ctx)
}

/// Maps command names to the factories of their handlers.
pub struct Dispatcher {
    table: BTreeMap<&'static str, Box<dyn CommandFactory>>,
}

impl Dispatcher {
    /// A dispatcher that knows no commands.
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Register a factory under its descriptor's name, replacing any previous one.
    pub fn register(&mut self, factory: Box<dyn CommandFactory>) {
        let name = factory.descriptor().name;
        if self.table.insert(name, factory).is_some() {
            warn!(command = name, "handler registered twice, keeping the last one");
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&dyn CommandFactory> {
        self.table.get(name).map(Box::as_ref)
    }

    /// Descriptors of every registered command, sorted by name.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.table.values().map(|f| f.descriptor()).collect()
    }

    /// Run the commands of one line in order.
    ///
    /// A failing command never prevents the following ones from running.
    pub fn dispatch(&self, group: &[ArgumentVector], env: &mut Environment) -> Vec<Dispatched> {
        group.iter().map(|argv| self.dispatch_one(argv, env)).collect()
    }

    /// Resolve and run a single argument vector.
    pub fn dispatch_one(&self, argv: &[String], env: &mut Environment) -> Dispatched {
        let reclaimed = env.jobs.clean();
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed finished jobs");
        }

        if let [only] = argv {
            if let Some(value) = env.variables.value(only) {
                let _ = writeln!(env.io.stdout.writer(), "{value}");
                return Dispatched::Completed(STATUS_OK);
            }
        }

        let mut plan = match redirect::plan(argv.to_vec()) {
            Ok(plan) => plan,
            Err(e) => {
                shell_error(env, &e);
                return Dispatched::Rejected(e.to_string());
            }
        };
        let name = env.variables.expand(&plan.argv[0]).to_lowercase();
        plan.argv[0] = name.clone();

        let Some(factory) = self.resolve(&name) else {
            shell_error(env, format!("{name}: command not found"));
            return Dispatched::NotFound(name);
        };

        let literal = (1 + factory.literal_operands()).min(plan.argv.len());
        let operands = env.variables.substitute(&plan.argv[literal..]);
        plan.argv.truncate(literal);
        plan.argv.extend(operands);
        plan.expand_targets(|target| env.variables.expand(target));

        let ctx = match bind(&plan, env) {
            Ok(ctx) => ctx,
            Err(e) => {
                shell_error(env, format!("{name}: {e}"));
                return Dispatched::Rejected(e.to_string());
            }
        };
        let invocation = Invocation::new(factory.create(), ctx);

        if plan.background {
            return match env.jobs.add(&env.owner, invocation) {
                Ok(id) => {
                    let _ = writeln!(env.io.stdout.writer(), "[{id}] {name}");
                    Dispatched::Background(id)
                }
                Err(e) => {
                    shell_error(env, format!("{name}: cannot start job: {e}"));
                    Dispatched::Rejected(e.to_string())
                }
            };
        }

        let outcome = invocation.drive();
        for (var, value) in outcome.exports {
            info!(variable = %var, "variable exported");
            env.variables.assign(&var, value);
        }
        Dispatched::Completed(outcome.status)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(Factory::<Cat>::default()));
        dispatcher.register(Box::new(Factory::<Echo>::default()));
        dispatcher.register(Box::new(Factory::<Export>::default()));
        dispatcher.register(Box::new(Factory::<Grep>::default()));
        dispatcher.register(Box::new(Factory::<Jobs>::default()));
        dispatcher.register(Box::new(Factory::<Pwd>::default()));
        dispatcher.register(Box::new(Factory::<Rmdir>::default()));
        dispatcher.register(Box::new(Factory::<Sleep>::default()));
        dispatcher.register(Box::new(Factory::<Wc>::default()));
        dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::ShellConfig;
    use crate::io_adapters::{MemWriter, SessionIo};
    use crate::lexer::{split_commands, tokenize};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Session {
        dir: TempDir,
        env: Environment,
        out: MemWriter,
        err: MemWriter,
        dispatcher: Dispatcher,
    }

    impl Session {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = ShellConfig {
                crash_dir: dir.path().join("crash"),
                job_grace: Duration::from_millis(5),
                ..ShellConfig::default()
            };
            let (io, out, err) = SessionIo::captured(b"");
            let mut env = Environment::new(&config, io);
            env.current_dir = dir.path().to_path_buf();
            Session {
                dir,
                env,
                out,
                err,
                dispatcher: Dispatcher::default(),
            }
        }

        fn line(&mut self, line: &str) -> Vec<Dispatched> {
            self.dispatcher.dispatch(&split_commands(line), &mut self.env)
        }
    }

    struct Boom;

    impl Command for Boom {
        fn run(&mut self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    impl CommandFactory for Factory<Boom> {
        fn descriptor(&self) -> Descriptor {
            Descriptor {
                name: "boom",
                about: "always panics",
            }
        }

        fn create(&self) -> Box<dyn Command> {
            Box::new(Boom)
        }
    }

    #[test]
    fn test_runs_group_in_order() {
        let mut s = Session::new();
        let results = s.line("echo one; ECHO Two ;; echo three");
        assert_eq!(results, vec![Dispatched::Completed(STATUS_OK); 3]);
        assert_eq!(s.out.contents(), "one\nTwo\nthree\n");
    }

    #[test]
    fn test_unknown_command_does_not_stop_group() {
        let mut s = Session::new();
        let results = s.line("nope a; echo after");
        assert_eq!(results[0], Dispatched::NotFound("nope".to_string()));
        assert_eq!(results[0].status(), STATUS_NOT_FOUND);
        assert_eq!(results[1], Dispatched::Completed(STATUS_OK));
        assert_eq!(s.err.contents(), "-flux: nope: command not found\n");
        assert_eq!(s.out.contents(), "after\n");
    }

    #[test]
    fn test_fault_does_not_stop_group() {
        let mut s = Session::new();
        s.dispatcher.register(Box::new(Factory::<Boom>::default()));
        let results = s.line("boom; echo survived");
        assert_eq!(results[0], Dispatched::Completed(STATUS_ERR));
        assert_eq!(results[1], Dispatched::Completed(STATUS_OK));
        assert!(s.err.contents().contains("(panic)"));
        assert_eq!(s.out.contents(), "survived\n");
        assert_eq!(fs::read_dir(s.dir.path().join("crash")).unwrap().count(), 1);
    }

    #[test]
    fn test_export_then_substitute() {
        let mut s = Session::new();
        s.line("export $who world; echo hello $who; $who");
        assert_eq!(s.env.variables.value("$who"), Some("world"));
        assert_eq!(s.out.contents(), "$who=world\nhello world\nworld\n");
    }

    #[test]
    fn test_export_updates_existing_variable() {
        let mut s = Session::new();
        let results = s.line("export $n 1; export $n 2");
        assert_eq!(results, vec![Dispatched::Completed(STATUS_OK); 2]);
        assert_eq!(s.env.variables.value("$n"), Some("2"));
        assert!(s.err.contents().is_empty());
    }

    #[test]
    fn test_export_updates_seeded_variable() {
        let mut s = Session::new();
        let results = s.line("export $HOME /elsewhere; echo $HOME");
        assert_eq!(results, vec![Dispatched::Completed(STATUS_OK); 2]);
        assert_eq!(s.env.variables.value("$HOME"), Some("/elsewhere"));
        assert_eq!(s.out.contents(), "$HOME=/elsewhere\n/elsewhere\n");
    }

    #[test]
    fn test_export_value_is_substituted() {
        let mut s = Session::new();
        s.line("export $a x; export $b $a");
        assert_eq!(s.env.variables.value("$b"), Some("x"));
    }

    #[test]
    fn test_redirect_before_name() {
        let mut s = Session::new();
        let results = s.line("2>err.txt ECHO hi");
        assert_eq!(results, vec![Dispatched::Completed(STATUS_OK)]);
        assert_eq!(s.out.contents(), "hi\n");
        assert!(s.dir.path().join("err.txt").exists());
    }

    #[test]
    fn test_redirect_target_is_substituted() {
        let mut s = Session::new();
        s.line("export $f saved.txt; echo kept > $f");
        let text = fs::read_to_string(s.dir.path().join("saved.txt")).unwrap();
        assert_eq!(text, "kept\n");
    }

    #[test]
    fn test_redirect_out_then_in() {
        let mut s = Session::new();
        s.line("echo first > notes.txt; echo second >> notes.txt");
        let text = fs::read_to_string(s.dir.path().join("notes.txt")).unwrap();
        assert_eq!(text, "first\nsecond\n");
        assert!(s.out.contents().is_empty());

        s.line("wc < notes.txt");
        assert_eq!(s.out.contents(), "2 2 13\n");
    }

    #[test]
    fn test_stderr_redirect() {
        let mut s = Session::new();
        s.line("cat missing 2> errors.txt");
        let text = fs::read_to_string(s.dir.path().join("errors.txt")).unwrap();
        assert!(text.starts_with("cat: cannot open `missing`"));
        assert!(s.err.contents().is_empty());
    }

    #[test]
    fn test_bad_redirections_are_rejected() {
        let mut s = Session::new();
        let results = s.line("echo a | wc; echo >; cat < absent.txt; echo ok");
        assert!(matches!(results[0], Dispatched::Rejected(_)));
        assert!(matches!(results[1], Dispatched::Rejected(_)));
        assert!(matches!(results[2], Dispatched::Rejected(_)));
        assert_eq!(results[3], Dispatched::Completed(STATUS_OK));

        let err = s.err.contents();
        assert!(err.contains("-flux: pipes are not supported\n"));
        assert!(err.contains("-flux: syntax error near unexpected token `newline'\n"));
        assert!(err.contains("-flux: cat: absent.txt: "));
    }

    #[test]
    fn test_background_job_runs_and_is_reclaimed() {
        let mut s = Session::new();
        let results = s.line("echo from job &");
        let Dispatched::Background(id) = results[0] else {
            panic!("expected a background job, got {:?}", results[0]);
        };
        assert_eq!(id, 1);

        let job = s.env.jobs.remove(id).unwrap();
        assert_eq!(job.wait(), STATUS_OK);
        let out = s.out.contents();
        assert!(out.contains("from job\n"));
        assert!(out.contains("[1] echo\n"));
    }

    #[test]
    fn test_background_exports_are_discarded() {
        let mut s = Session::new();
        let results = s.line("export $bg 1 &");
        let Dispatched::Background(id) = results[0] else {
            panic!("expected a background job");
        };
        s.env.jobs.remove(id).unwrap().wait();
        assert!(!s.env.variables.exists("$bg"));
    }

    #[test]
    fn test_finished_jobs_are_cleaned_before_next_command() {
        let mut s = Session::new();
        s.line("echo a &");
        let job = s.env.jobs.list()[0].clone();
        while !s.env.jobs.find(job.id).is_some_and(|j| j.finished) {
            std::thread::sleep(Duration::from_millis(5));
        }
        s.dispatcher.dispatch_one(&tokenize("echo b"), &mut s.env);
        assert!(s.env.jobs.is_empty());
    }

    #[test]
    fn test_descriptors_are_sorted() {
        let names: Vec<_> = Dispatcher::default()
            .descriptors()
            .iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec!["cat", "echo", "export", "grep", "jobs", "pwd", "rmdir", "sleep", "wc"]
        );
    }
}
