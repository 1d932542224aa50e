//! Background jobs.
//!
//! A [`Job`] is one [`Invocation`] running on its own thread. The
//! [`JobRegistry`] hands out identifiers from a monotonic counter, keeps the
//! jobs in insertion order, and reclaims finished ones.

use crate::command::{ExitCode, Invocation, STATUS_ERR};
use crate::config::DEFAULT_JOB_GRACE;
use crate::lexer::ArgumentVector;
use chrono::{DateTime, Local};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

pub type JobId = u32;

/// One running or finished handler invocation.
pub struct Job {
    id: JobId,
    owner: String,
    argv: ArgumentVector,
    started: DateTime<Local>,
    status: Arc<OnceLock<ExitCode>>,
    handle: JoinHandle<()>,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn argv(&self) -> &ArgumentVector {
        &self.argv
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Final status. Always `None` while the thread is alive.
    pub fn status(&self) -> Option<ExitCode> {
        if self.is_finished() {
            self.status.get().copied()
        } else {
            None
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            owner: self.owner.clone(),
            argv: self.argv.clone(),
            started: self.started,
            status: self.status(),
            finished: self.is_finished(),
        }
    }

    /// Block until the job's thread ends and return its status.
    pub fn wait(self) -> ExitCode {
        if self.handle.join().is_err() {
            return STATUS_ERR;
        }
        self.status.get().copied().unwrap_or(STATUS_ERR)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("argv", &self.argv)
            .field("status", &self.status())
            .finish()
    }
}

/// A point-in-time copy of a job's state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: JobId,
    pub owner: String,
    pub argv: ArgumentVector,
    pub started: DateTime<Local>,
    pub status: Option<ExitCode>,
    pub finished: bool,
}

impl JobInfo {
    pub fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Local::now() - self.started
    }
}

impl fmt::Display for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.id,
            self.owner,
            self.name(),
            format_elapsed(self.elapsed().num_seconds())
        )
    }
}

/// `3h 2m 1s`, `2m 1s` or `1s`.
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Owns every background job of a session.
///
/// The job list is the only state touched from several threads: the session
/// adds and cleans, job threads only publish their own status.
pub struct JobRegistry {
    jobs: Mutex<Vec<Job>>,
    next_id: AtomicU32,
    grace: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_GRACE)
    }
}

impl JobRegistry {
    /// `grace` is how long [`JobRegistry::add`] waits after starting a job.
    pub fn new(grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `invocation` on its own thread and track it.
    ///
    /// Returns after the grace delay so a job that fails immediately has
    /// already settled.
    pub fn add(&self, owner: &str, invocation: Invocation) -> io::Result<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let argv = invocation.argv().clone();
        let name = argv.first().cloned().unwrap_or_default();
        let status = Arc::new(OnceLock::new());

        let published = status.clone();
        let handle = thread::Builder::new()
            .name(format!("job-{id}-{name}"))
            .spawn(move || {
                let outcome = invocation.drive();
                if !outcome.exports.is_empty() {
                    debug!(job = id, "discarding variable exports from background job");
                }
                let _ = published.set(outcome.status);
            })?;

        info!(job = id, owner, command = %name, "job started");
        self.lock().push(Job {
            id,
            owner: owner.to_string(),
            argv,
            started: Local::now(),
            status,
            handle,
        });

        thread::sleep(self.grace);
        Ok(id)
    }

    pub fn find(&self, id: JobId) -> Option<JobInfo> {
        self.lock().iter().find(|job| job.id == id).map(Job::info)
    }

    /// Take a job out of the registry, running or not.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut jobs = self.lock();
        let pos = jobs.iter().position(|job| job.id == id)?;
        Some(jobs.remove(pos))
    }

    /// Snapshot of all jobs in insertion order.
    pub fn list(&self) -> Vec<JobInfo> {
        self.lock().iter().map(Job::info).collect()
    }

    /// Drop every job whose thread has finished and return how many were reclaimed.
    pub fn clean(&self) -> usize {
        let finished: Vec<Job> = {
            let mut jobs = self.lock();
            let (finished, running): (Vec<Job>, Vec<Job>) =
                std::mem::take(&mut *jobs).into_iter().partition(Job::is_finished);
            *jobs = running;
            finished
        };

        let reclaimed = finished.len();
        for job in finished {
            let id = job.id;
            let status = job.wait();
            debug!(job = id, status, "job reclaimed");
        }
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandContext, STATUS_OK};
    use crate::io_adapters::MemWriter;
    use anyhow::Result;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Instant;

    /// Blocks in `run` until the test releases it.
    struct Gate(Receiver<ExitCode>);

    impl Command for Gate {
        fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
            let code = self.0.recv()?;
            ctx.set_status(code);
            Ok(())
        }
    }

    struct Panics;

    impl Command for Panics {
        fn run(&mut self, _ctx: &mut CommandContext) -> Result<()> {
            panic!("job blew up");
        }
    }

    fn invocation(handler: Box<dyn Command>, name: &str) -> Invocation {
        let dir = std::env::temp_dir().join("flux-crash-tests");
        let ctx = CommandContext::new(vec![name.to_string()])
            .with_stdout(Box::new(MemWriter::new()), false)
            .with_stderr(Box::new(MemWriter::new()), false)
            .with_crash_dir(dir);
        Invocation::new(handler, ctx)
    }

    fn gated(name: &str) -> (Invocation, mpsc::Sender<ExitCode>) {
        let (tx, rx) = mpsc::channel();
        (invocation(Box::new(Gate(rx)), name), tx)
    }

    fn wait_until_finished(registry: &JobRegistry, id: JobId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.find(id).map(|j| j.finished).unwrap_or(true) {
            assert!(Instant::now() < deadline, "job {id} did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = JobRegistry::new(Duration::ZERO);
        let (a, ta) = gated("a");
        let (b, tb) = gated("b");
        let id_a = registry.add("me", a).unwrap();
        let id_b = registry.add("me", b).unwrap();
        assert!(id_b > id_a);
        ta.send(STATUS_OK).unwrap();
        tb.send(STATUS_OK).unwrap();
    }

    #[test]
    fn test_status_absent_while_running() {
        let registry = JobRegistry::new(Duration::ZERO);
        let (inv, tx) = gated("sleepy");
        let id = registry.add("me", inv).unwrap();

        let info = registry.find(id).unwrap();
        assert_eq!(info.status, None);
        assert!(!info.finished);
        assert_eq!(info.owner, "me");
        assert_eq!(info.name(), "sleepy");

        tx.send(3).unwrap();
        wait_until_finished(&registry, id);
        assert_eq!(registry.find(id).unwrap().status, Some(3));
    }

    #[test]
    fn test_clean_reclaims_only_finished_jobs() {
        let registry = JobRegistry::new(Duration::ZERO);
        let (done, tx_done) = gated("done");
        let (running, tx_running) = gated("running");
        let done_id = registry.add("me", done).unwrap();
        let running_id = registry.add("me", running).unwrap();

        tx_done.send(STATUS_OK).unwrap();
        wait_until_finished(&registry, done_id);

        assert_eq!(registry.clean(), 1);
        let left = registry.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, running_id);
        assert!(left.iter().all(|j| !j.finished));

        tx_running.send(STATUS_OK).unwrap();
        wait_until_finished(&registry, running_id);
        assert_eq!(registry.clean(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_a_snapshot_in_insertion_order() {
        let registry = JobRegistry::new(Duration::ZERO);
        let (a, ta) = gated("first");
        let (b, tb) = gated("second");
        registry.add("me", a).unwrap();
        registry.add("me", b).unwrap();

        let mut snapshot = registry.list();
        let names: Vec<_> = snapshot.iter().map(|j| j.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);

        snapshot.clear();
        assert_eq!(registry.len(), 2);

        ta.send(STATUS_OK).unwrap();
        tb.send(STATUS_OK).unwrap();
    }

    #[test]
    fn test_remove_hands_over_the_job() {
        let registry = JobRegistry::new(Duration::ZERO);
        let (inv, tx) = gated("worker");
        let id = registry.add("me", inv).unwrap();

        let job = registry.remove(id).unwrap();
        assert!(registry.find(id).is_none());
        assert!(registry.remove(id).is_none());

        tx.send(5).unwrap();
        assert_eq!(job.wait(), 5);
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let registry = JobRegistry::new(Duration::ZERO);
        let id = registry.add("me", invocation(Box::new(Panics), "bad")).unwrap();
        wait_until_finished(&registry, id);
        assert_eq!(registry.find(id).unwrap().status, Some(STATUS_ERR));
    }

    #[test]
    fn test_add_waits_for_grace_delay() {
        let registry = JobRegistry::new(Duration::from_millis(50));
        let (inv, tx) = gated("slow");
        tx.send(STATUS_OK).unwrap();
        let start = Instant::now();
        registry.add("me", inv).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0s");
        assert_eq!(format_elapsed(59), "59s");
        assert_eq!(format_elapsed(61), "1m 1s");
        assert_eq!(format_elapsed(3 * 3600 + 2 * 60 + 1), "3h 2m 1s");
        assert_eq!(format_elapsed(-5), "0s");
    }
}
