use crate::command::{Command, CommandContext, CommandFactory, Descriptor, STATUS_ERR};
use crate::dispatch::Factory;
use crate::lexer::strip_quotes;
use crate::messages;
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use regex::{Regex, RegexBuilder};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Built-in commands whose arguments are declared with [`argh`].
///
/// The handler only implements [`Builtin::run`]; [`Parsed`] takes care of
/// parsing in `setup` and of `--help` and usage errors.
pub trait Builtin: FromArgs + Send + 'static {
    /// Canonical name of the command, e.g. "echo" or "grep".
    fn name() -> &'static str;

    /// One-line summary shown by `help`.
    fn about() -> &'static str;

    /// Performs the command using the streams bound to `ctx`.
    ///
    /// Report user errors through `ctx.error(..)`; an `Err` is treated as a
    /// fault and ends up in a crash report.
    fn run(&mut self, ctx: &mut CommandContext) -> Result<()>;
}

/// Adapts a [`Builtin`] to the command lifecycle.
pub struct Parsed<T> {
    args: Option<T>,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self { args: None }
    }
}

impl<T: Builtin> Command for Parsed<T> {
    fn setup(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let rest: Vec<&str> = ctx.argv().iter().skip(1).map(String::as_str).collect();
        match T::from_args(&[T::name()], &rest) {
            Ok(args) => self.args = Some(args),
            Err(EarlyExit { output, status }) => {
                match status {
                    Ok(()) => writeln!(ctx.stdout(), "{}", output.trim_end())?,
                    Err(()) => {
                        ctx.set_status(STATUS_ERR);
                        writeln!(ctx.stderr(), "{}", output.trim_end())?;
                    }
                }
                ctx.abort();
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let args = self
            .args
            .as_mut()
            .with_context(|| format!("{}: run before setup", T::name()))?;
        args.run(ctx)
    }
}

impl<T: Builtin> CommandFactory for Factory<T> {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: T::name(),
            about: T::about(),
        }
    }

    fn create(&self) -> Box<dyn Command> {
        Box::new(Parsed::<T>::default())
    }
}

/// Read the rest of stdin as lines, newlines kept.
fn read_stdin_lines(ctx: &mut CommandContext) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    while let Some(line) = ctx.input()? {
        lines.push(line);
    }
    Ok(lines)
}

/// Read a file relative to the session directory, reporting failures on `ctx`.
fn read_file(ctx: &mut CommandContext, name: &str) -> Result<Option<String>> {
    match fs::read_to_string(ctx.resolve(name)) {
        Ok(text) => Ok(Some(text)),
        Err(e) => {
            ctx.error(messages::for_io_error(name, &e))?;
            Ok(None)
        }
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl Builtin for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn about() -> &'static str {
        "print the current working directory"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let cwd = ctx.current_dir().display().to_string();
        ctx.print(cwd)?;
        Ok(())
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl Builtin for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn about() -> &'static str {
        "write arguments to standard output"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let s = self.args.join(" ");
        if self.no_newline {
            write!(ctx.stdout(), "{}", s)?;
        } else {
            ctx.print(s)?;
        }
        Ok(())
    }
}

#[derive(FromArgs)]
/// count lines, words and bytes
pub struct Wc {
    #[argh(positional, greedy)]
    /// files to count. If none provided, reads from stdin.
    pub files: Vec<String>,
}

fn counts(text: &str) -> (usize, usize, usize) {
    (text.lines().count(), text.split_whitespace().count(), text.len())
}

impl Builtin for Wc {
    fn name() -> &'static str {
        "wc"
    }

    fn about() -> &'static str {
        "count lines, words and bytes"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        if self.files.is_empty() {
            let buf = read_stdin_lines(ctx)?.concat();
            let (lines, words, bytes) = counts(&buf);
            ctx.print(format!("{} {} {}", lines, words, bytes))?;
            return Ok(());
        }
        for fname in &self.files {
            if let Some(s) = read_file(ctx, fname)? {
                let (lines, words, bytes) = counts(&s);
                ctx.print(format!("{} {} {} {}", lines, words, bytes, fname))?;
            }
        }
        Ok(())
    }
}

#[derive(FromArgs)]
/// print file(s) to stdout
pub struct Cat {
    #[argh(positional, greedy)]
    /// files to print. If none provided, copies stdin.
    pub files: Vec<String>,
}

impl Builtin for Cat {
    fn name() -> &'static str {
        "cat"
    }

    fn about() -> &'static str {
        "print files to standard output"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        if self.files.is_empty() {
            while let Some(line) = ctx.input()? {
                write!(ctx.stdout(), "{}", line)?;
            }
            return Ok(());
        }
        for fname in &self.files {
            let path = ctx.resolve(fname);
            match fs::File::open(&path) {
                Ok(f) => {
                    io::copy(&mut BufReader::new(f), ctx.stdout())
                        .with_context(|| format!("cat: copying {}", path.display()))?;
                }
                Err(e) => ctx.error(messages::for_io_error(fname, &e))?,
            }
        }
        Ok(())
    }
}

#[derive(FromArgs)]
/// print lines matching a pattern
pub struct Grep {
    #[argh(positional)]
    /// the pattern to search for (a regular expression)
    pub pattern: String,

    #[argh(positional, greedy)]
    /// files to search. If none provided, reads from stdin.
    pub files: Vec<String>,

    #[argh(switch, short = 'w')]
    /// match only whole words (using non-word characters as boundaries)
    pub word_regexp: bool,

    #[argh(switch, short = 'i')]
    /// ignore case distinctions
    pub ignore_case: bool,

    #[argh(option, short = 'A', default = "0")]
    /// print NUM lines of trailing context after matching lines
    pub after_context: usize,
}

impl Grep {
    fn regex(&self) -> Result<Regex, regex::Error> {
        let pattern = if self.word_regexp {
            format!(r"\b({})\b", self.pattern)
        } else {
            self.pattern.clone()
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(self.ignore_case)
            .build()
    }

    /// Render the matching lines of one source, with trailing context.
    fn select(&self, lines: &[String], file_name: Option<&str>, re: &Regex) -> String {
        let total_lines = lines.len();
        let mut to_print = vec![false; total_lines];

        for (i, line) in lines.iter().enumerate() {
            if re.is_match(line) {
                let end_print = (i + self.after_context + 1).min(total_lines);
                to_print[i..end_print].iter_mut().for_each(|p| *p = true);
            }
        }

        let prefix = file_name
            .map(|name| format!("{}:", name))
            .unwrap_or_default();
        let mut out = String::new();
        let mut last_printed: Option<usize> = None;

        for (i, line) in lines.iter().enumerate().filter(|(i, _)| to_print[*i]) {
            if self.after_context > 0 && last_printed.is_some_and(|last| i > last + 1) {
                out.push_str("--\n");
            }
            out.push_str(&prefix);
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
            last_printed = Some(i);
        }
        out
    }
}

impl Builtin for Grep {
    fn name() -> &'static str {
        "grep"
    }

    fn about() -> &'static str {
        "print lines matching a pattern"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let re = match self.regex() {
            Ok(re) => re,
            Err(e) => {
                ctx.error(messages::invalid_argument(&self.pattern, Some(&e.to_string())))?;
                return Ok(());
            }
        };

        if self.files.is_empty() {
            let lines = read_stdin_lines(ctx)?;
            let out = self.select(&lines, None, &re);
            ctx.stdout().write_all(out.as_bytes())?;
            return Ok(());
        }

        for file_name in &self.files {
            let Some(text) = read_file(ctx, file_name)? else {
                continue;
            };
            let lines: Vec<String> = BufReader::new(text.as_bytes())
                .lines()
                .collect::<io::Result<_>>()?;
            let out = self.select(&lines, Some(file_name), &re);
            ctx.stdout().write_all(out.as_bytes())?;
        }
        Ok(())
    }
}

#[derive(FromArgs)]
/// pause for the given number of seconds
pub struct Sleep {
    #[argh(positional)]
    /// seconds to sleep, fractions allowed
    pub seconds: f64,
}

impl Builtin for Sleep {
    fn name() -> &'static str {
        "sleep"
    }

    fn about() -> &'static str {
        "pause for a number of seconds"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        if !self.seconds.is_finite() || self.seconds < 0.0 {
            ctx.error(messages::invalid_argument(
                self.seconds,
                Some("must be a non-negative number"),
            ))?;
            return Ok(());
        }
        thread::sleep(Duration::from_secs_f64(self.seconds));
        Ok(())
    }
}

#[derive(FromArgs)]
/// Remove the DIRECTORY(ies), if they are empty
pub struct Rmdir {
    #[argh(positional, greedy)]
    /// the directories to remove
    pub paths: Vec<String>,

    #[argh(switch, short = 'p')]
    /// remove DIRECTORY and its ancestors; e.g., 'rmdir -p a/b' is similar to 'rmdir a/b a'
    pub parents: bool,

    #[argh(switch, short = 'v')]
    /// output a diagnostic for every directory processed
    pub verbose: bool,
}

impl Rmdir {
    fn remove_one(&self, ctx: &mut CommandContext, name: &str) -> Result<()> {
        let path = ctx.resolve(name);
        if !path.exists() {
            ctx.error(messages::path_not_found(name))?;
            return Ok(());
        }
        if !path.is_dir() {
            ctx.error(messages::not_a_dir(name))?;
            return Ok(());
        }

        let mut current = PathBuf::from(name);
        let mut first = true;
        loop {
            if let Err(e) = fs::remove_dir(ctx.resolve(&current)) {
                // -p stops quietly at the first ancestor that cannot go.
                if first {
                    ctx.error(messages::for_io_error(name, &e))?;
                }
                break;
            }
            first = false;
            if self.verbose {
                ctx.print(format!("rmdir: removing directory '{}'", current.display()))?;
            }
            if !self.parents {
                break;
            }
            match current.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
                _ => break,
            }
        }
        Ok(())
    }
}

impl Builtin for Rmdir {
    fn name() -> &'static str {
        "rmdir"
    }

    fn about() -> &'static str {
        "remove empty directories"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        if self.paths.is_empty() {
            ctx.error(messages::parameter_not_specified("DIRECTORY"))?;
            return Ok(());
        }
        for name in self.paths.clone() {
            self.remove_one(ctx, &name)?;
        }
        Ok(())
    }
}

#[derive(FromArgs)]
/// list background jobs of this session
pub struct Jobs {
    #[argh(switch, short = 'l')]
    /// also show the state and the full command line
    pub long: bool,
}

impl Builtin for Jobs {
    fn name() -> &'static str {
        "jobs"
    }

    fn about() -> &'static str {
        "list background jobs"
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let lines: Vec<String> = ctx
            .jobs()
            .iter()
            .map(|job| {
                if !self.long {
                    return job.to_string();
                }
                let state = match (job.finished, job.status) {
                    (true, Some(code)) => format!("Done({code})"),
                    (true, None) => "Done".to_string(),
                    (false, _) => "Running".to_string(),
                };
                format!("{job}\t{state}\t{}", job.argv.join(" "))
            })
            .collect();
        for line in lines {
            ctx.print(line)?;
        }
        Ok(())
    }
}

/// `export $name value`: create or update a session variable.
///
/// Takes the raw argument vector instead of going through argh, since the
/// name starts with `$` and the value may span several words.
#[derive(Debug, Default)]
pub struct Export {
    name: String,
    value: String,
}

impl Command for Export {
    fn setup(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let argv = ctx.argv().clone();
        if argv.len() < 3 {
            ctx.error("usage: export $name value")?;
            ctx.abort();
            return Ok(());
        }
        if !argv[1].starts_with('$') || argv[1].len() < 2 {
            ctx.error(messages::invalid_argument(
                &argv[1],
                Some("variable names start with `$`"),
            ))?;
            ctx.abort();
            return Ok(());
        }
        self.name = argv[1].clone();
        self.value = strip_quotes(&argv[2..].join(" ")).to_string();
        Ok(())
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        ctx.export(self.name.clone(), self.value.clone());
        ctx.print(format!("{}={}", self.name, self.value))?;
        Ok(())
    }
}

impl CommandFactory for Factory<Export> {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: "export",
            about: "create or update a session variable",
        }
    }

    fn create(&self) -> Box<dyn Command> {
        Box::new(Export::default())
    }

    fn literal_operands(&self) -> usize {
        1
    }
}
