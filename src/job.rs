use crate::error::{Cancelled, ResourceExhausted};
use crate::job_logger::{CancelToken, Console, JobLogger};
use crate::timed_span;
use crate::util::sanitize_job_name;
use camino::{Utf8Path, Utf8PathBuf};
use downcast_rs::{impl_downcast, Downcast};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant, SystemTime};

pub type JobId = usize;

/// The external computation a job wraps. Runs on the job's own worker thread.
pub trait JobBody: Downcast + Send {
    fn run(&mut self, log: &JobLogger) -> anyhow::Result<()>;
}
impl_downcast!(JobBody);

impl<F> JobBody for F
where
    F: FnMut(&JobLogger) -> anyhow::Result<()> + Send + 'static,
{
    fn run(&mut self, log: &JobLogger) -> anyhow::Result<()> {
        self(log)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Aborted,
}

#[derive(Debug)]
pub enum JobOutcome {
    Success(Duration),
    Failure(anyhow::Error),
    Cancelled,
    FatalResourceError(anyhow::Error),
}

impl JobOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            JobOutcome::Success(_) => "success",
            JobOutcome::Failure(_) => "failure",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::FatalResourceError(_) => "fatal",
        }
    }
}

// ----------------------------------------------------------------------------
// Job
// ----------------------------------------------------------------------------

pub struct Job {
    name: String,
    output_dir: Utf8PathBuf,
    pub(crate) state: JobState,
    pub(crate) start_time: Option<SystemTime>,
    pub(crate) elapsed: Option<Duration>,
    pub(crate) body: Option<Box<dyn JobBody>>,
}

impl Job {
    pub fn new(name: &str, output_dir: impl Into<Utf8PathBuf>, body: impl JobBody) -> Self {
        Job::from_boxed(name, output_dir, Box::new(body))
    }

    /// Job whose body is a closure.
    pub fn from_fn<F>(name: &str, output_dir: impl Into<Utf8PathBuf>, f: F) -> Self
    where
        F: FnMut(&JobLogger) -> anyhow::Result<()> + Send + 'static,
    {
        Job::from_boxed(name, output_dir, Box::new(f))
    }

    pub fn from_boxed(name: &str, output_dir: impl Into<Utf8PathBuf>, body: Box<dyn JobBody>) -> Self {
        Job {
            name: sanitize_job_name(name),
            output_dir: output_dir.into(),
            state: JobState::Queued,
            start_time: None,
            elapsed: None,
            body: Some(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    /// Set only once the job has finished successfully.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn log_file_path(&self) -> Utf8PathBuf {
        log_file_path(&self.output_dir, &self.name)
    }

    /// The job body, if it is not out on a worker thread.
    pub fn body(&self) -> Option<&dyn JobBody> {
        self.body.as_deref()
    }

    /// Downcast the body to read results out of it.
    pub fn body_as<T: JobBody>(&self) -> Option<&T> {
        self.body.as_deref().and_then(|b| b.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("elapsed", &self.elapsed)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

pub fn log_file_path(output_dir: &Utf8Path, job_name: &str) -> Utf8PathBuf {
    output_dir.join(format!("{}.log.txt", job_name))
}

// ----------------------------------------------------------------------------
// Worker side
// ----------------------------------------------------------------------------

/// Everything a worker thread needs to run one job.
pub(crate) struct JobRun {
    pub name: String,
    pub output_dir: Utf8PathBuf,
    pub cancel: CancelToken,
    pub console: Option<Console>,
}

const OUT_OF_MEMORY_HELP: &str = "ERROR: OUT OF MEMORY!\n\n\
Solutions:\n\
- reduce the number of cores (parallel jobs) or\n\
- run the job on its own with more memory available\n";

impl JobRun {
    /// Run `body` to an outcome. Never panics and never lets an error escape:
    /// the log file is closed exactly once on every path.
    pub fn execute(&self, body: &mut dyn JobBody) -> JobOutcome {
        let _span = timed_span!(tracing::Level::DEBUG, "job_run", job = %self.name);

        let mut log = JobLogger::new(self.name.clone(), self.cancel.clone());
        if let Some(console) = &self.console {
            log = log.with_console(console.clone());
        }

        let log_path = log_file_path(&self.output_dir, &self.name);
        if let Err(e) = log.create_log_file(&log_path) {
            return JobOutcome::Failure(
                anyhow::Error::new(e).context(format!("Failed to create log file {}", log_path)),
            );
        }
        log.set_check_interrupt(true);

        let t0 = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| body.run(&log)));
        let elapsed = t0.elapsed();

        // Error reports must reach the log even though the batch may be stopping.
        log.set_check_interrupt(false);

        let outcome = match result {
            Ok(Ok(())) => JobOutcome::Success(elapsed),
            Ok(Err(e)) => classify_error(e),
            Err(panic) => JobOutcome::Failure(anyhow::anyhow!("job panicked: {}", panic_message(&*panic))),
        };

        match &outcome {
            JobOutcome::Failure(e) => {
                let _ = log.println(&format!("\nABORTED WITH ERROR:\n{:?}", e));
            }
            JobOutcome::FatalResourceError(e) => {
                let _ = log.println(&format!("\n{:?}", e));
                let _ = log.println(OUT_OF_MEMORY_HELP);
            }
            JobOutcome::Success(_) | JobOutcome::Cancelled => {}
        }

        match log.close_log_file() {
            Ok(_) => outcome,
            Err(e) => match outcome {
                JobOutcome::Success(_) => JobOutcome::Failure(
                    anyhow::Error::new(e).context(format!("Failed to close log file {}", log_path)),
                ),
                other => {
                    tracing::warn!("Failed to close log file {}: {}", log_path, e);
                    other
                }
            },
        }
    }
}

fn classify_error(e: anyhow::Error) -> JobOutcome {
    if e.chain().any(|c| c.is::<Cancelled>()) {
        JobOutcome::Cancelled
    } else if e
        .chain()
        .any(|c| c.is::<ResourceExhausted>() || c.is::<std::collections::TryReserveError>())
    {
        JobOutcome::FatalResourceError(e)
    } else {
        JobOutcome::Failure(e)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bail_loc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn run_in(dir: &Utf8Path, name: &str, cancel: CancelToken, body: &mut dyn JobBody) -> JobOutcome {
        let run = JobRun {
            name: name.to_owned(),
            output_dir: dir.to_owned(),
            cancel,
            console: None,
        };
        run.execute(body)
    }

    fn utf8(dir: &tempfile::TempDir) -> &Utf8Path {
        Utf8Path::from_path(dir.path()).expect("utf8 temp dir")
    }

    #[test]
    fn new_job_is_queued_with_sanitized_name() {
        let job = Job::from_fn("my network 1", "/tmp/out", |_| Ok(()));
        assert_eq!(job.name(), "my_network_1");
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.elapsed(), None);
        assert_eq!(job.log_file_path(), Utf8PathBuf::from("/tmp/out/my_network_1.log.txt"));
    }

    #[test]
    fn success_reports_elapsed_and_writes_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = |log: &JobLogger| -> anyhow::Result<()> {
            log.println("computing kernel")?;
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        };

        let outcome = run_in(utf8(&dir), "ok", CancelToken::new(), &mut body);
        match outcome {
            JobOutcome::Success(elapsed) => assert!(elapsed >= Duration::from_millis(5)),
            other => panic!("expected success, got {:?}", other),
        }

        let text = std::fs::read_to_string(dir.path().join("ok.log.txt"))?;
        assert_eq!(text, "computing kernel\n");
        Ok(())
    }

    #[test]
    fn error_is_failure_and_logged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = |log: &JobLogger| -> anyhow::Result<()> {
            log.println("loading network")?;
            bail_loc!("gene score file is empty")
        };

        let outcome = run_in(utf8(&dir), "bad", CancelToken::new(), &mut body);
        assert!(matches!(outcome, JobOutcome::Failure(_)));

        let text = std::fs::read_to_string(dir.path().join("bad.log.txt"))?;
        assert!(text.starts_with("loading network\n"));
        assert!(text.contains("ABORTED WITH ERROR"));
        assert!(text.contains("gene score file is empty"));
        Ok(())
    }

    #[test]
    fn panic_is_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = |_: &JobLogger| -> anyhow::Result<()> { panic!("index out of range") };

        match run_in(utf8(&dir), "panics", CancelToken::new(), &mut body) {
            JobOutcome::Failure(e) => assert!(e.to_string().contains("index out of range")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(dir.path().join("panics.log.txt").exists());
        Ok(())
    }

    #[test]
    fn cancel_observed_at_next_log_write() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let mut body = move |log: &JobLogger| -> anyhow::Result<()> {
            log.println("permutation 1")?;
            token.cancel();
            log.println("permutation 2")?;
            Ok(())
        };

        let outcome = run_in(utf8(&dir), "stopped", cancel, &mut body);
        assert!(matches!(outcome, JobOutcome::Cancelled));

        let text = std::fs::read_to_string(dir.path().join("stopped.log.txt"))?;
        assert!(text.contains("permutation 1"));
        assert!(text.contains("JOB INTERRUPTED!"));
        assert!(!text.contains("permutation 2"));
        Ok(())
    }

    #[test]
    fn resource_exhaustion_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = |_: &JobLogger| -> anyhow::Result<()> {
            Err(anyhow::Error::new(ResourceExhausted::new("kernel matrix too large")).context("building kernel"))
        };

        let outcome = run_in(utf8(&dir), "oom", CancelToken::new(), &mut body);
        assert!(matches!(outcome, JobOutcome::FatalResourceError(_)));

        let text = std::fs::read_to_string(dir.path().join("oom.log.txt"))?;
        assert!(text.contains("OUT OF MEMORY"));
        Ok(())
    }

    #[test]
    fn try_reserve_error_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = |_: &JobLogger| -> anyhow::Result<()> {
            let mut v: Vec<u64> = Vec::new();
            v.try_reserve(usize::MAX)?;
            Ok(())
        };

        let outcome = run_in(utf8(&dir), "reserve", CancelToken::new(), &mut body);
        assert!(matches!(outcome, JobOutcome::FatalResourceError(_)));
        Ok(())
    }

    #[test]
    fn missing_output_dir_is_failure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let mut body = move |_: &JobLogger| -> anyhow::Result<()> {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        };
        let outcome = run_in(
            Utf8Path::new("/nonexistent/magnum-jobs/output"),
            "nowhere",
            CancelToken::new(),
            &mut body,
        );
        assert!(matches!(outcome, JobOutcome::Failure(_)));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
