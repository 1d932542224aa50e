//! Crash reports written when a fault escapes a command.

use crate::command::Fault;
use chrono::Local;
use std::backtrace::Backtrace;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Create a fresh `<prog>_<timestamp>_<n>.log` file in `dir`.
fn create_unique(dir: &Path, prog: &str) -> io::Result<(File, PathBuf)> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let prog: String = prog
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();

    for n in 0u32.. {
        let path = dir.join(format!("{prog}_{stamp}_{n}.log"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other("no free crash report name"))
}

/// Write a crash report for `argv` and return its path.
pub(crate) fn write_report(
    dir: &Path,
    prog: &str,
    argv: &[String],
    fault: &Fault,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let (mut file, path) = create_unique(dir, prog)?;

    writeln!(file, "flux crash report")?;
    writeln!(file, "time:    {}", Local::now().to_rfc3339())?;
    writeln!(file, "command: {}", argv.join(" "))?;
    writeln!(
        file,
        "thread:  {}",
        std::thread::current().name().unwrap_or("<unnamed>")
    )?;
    writeln!(file, "fault:   {}", fault.kind())?;
    writeln!(file)?;

    match fault {
        Fault::Error(err) => {
            writeln!(file, "error: {err}")?;
            for cause in err.chain().skip(1) {
                writeln!(file, "caused by: {cause}")?;
            }
        }
        Fault::Panic(message) => writeln!(file, "panic: {message}")?,
    }

    writeln!(file)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", Backtrace::force_capture())?;
    file.flush()?;
    Ok(path)
}
