use argh::FromArgs;
use flux_shell::Interpreter;
use flux_shell::command::Level;
use flux_shell::config::ShellConfig;
use flux_shell::dispatch::Dispatcher;
use flux_shell::io_adapters::SessionIo;
use flux_shell::logging;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(FromArgs)]
/// An interactive command shell.
struct Cli {
    #[argh(option)]
    /// diagnostic log filter, e.g. `debug`; FLUX_LOG takes precedence
    log: Option<String>,

    #[argh(option)]
    /// directory crash reports are written to
    crash_dir: Option<PathBuf>,

    #[argh(option)]
    /// milliseconds to wait after starting a background job
    job_grace_ms: Option<u64>,

    #[argh(option, default = "Level::NotSet")]
    /// lowest severity of messages shown by commands (debug, info, warning, error, critical)
    verbosity: Level,

    #[argh(switch)]
    /// do not keep a history of entered lines
    no_history: bool,
}

impl Cli {
    fn into_config(self) -> ShellConfig {
        let defaults = ShellConfig::default();
        ShellConfig {
            log_filter: self.log.unwrap_or(defaults.log_filter),
            crash_dir: self.crash_dir.unwrap_or(defaults.crash_dir),
            job_grace: self
                .job_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.job_grace),
            verbosity: self.verbosity,
            history: !self.no_history,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = argh::from_env::<Cli>().into_config();
    logging::init(&config.log_filter)?;
    info!(crash_dir = %config.crash_dir.display(), "starting session");

    let mut shell = Interpreter::new(config, Dispatcher::default(), SessionIo::terminal());
    let code = shell.repl()?;
    std::process::exit(code);
}
