//! The batch scheduler.
//!
//! A [`JobScheduler`] owns one batch of jobs and is only ever touched from the
//! thread draining its [`DispatchQueue`]. Worker threads never see it: each
//! one runs a single job and posts a [`JobCompletion`] back through the queue,
//! so concurrent completions become one ordered stream of updates.
//!
//! ```text
//! Queued --admit--> Running --success--> Finished
//!                           --failure / cancel / fatal / stop requested--> Aborted
//! ```
//!
//! Jobs that are still queued when the batch stops are never attempted and
//! stay `Queued`.

use crate::anyhow_loc;
use crate::dispatch::{DispatchQueue, Dispatcher};
use crate::error::StartError;
use crate::job::{Job, JobBody, JobId, JobOutcome, JobRun, JobState};
use crate::job_logger::{CancelToken, Console};
use crate::status::ProgressEvent;
use crate::util::{format_duration, pluralize};
use camino::Utf8Path;
use crossbeam::channel::Sender;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant, SystemTime};

// ----------------------------------------------------------------------------
// Declarations
// ----------------------------------------------------------------------------

/// One consistent snapshot of the four job pools.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub aborted: usize,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum TerminalClassification {
    AllSucceeded,
    SucceededWithErrors,
    Cancelled,
    Fatal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub counts: JobCounts,
    pub classification: TerminalClassification,
    pub elapsed: Duration,
}

/// What a status view shows.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BatchStatus {
    Ongoing,
    /// At least one job was aborted while the rest keep running. Sticky.
    OngoingWithErrors,
    Stopping,
    Done(TerminalClassification),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub counts: JobCounts,
    pub status: BatchStatus,
}

/// Posted by a worker once its job has run to an outcome.
pub struct JobCompletion {
    pub id: JobId,
    pub outcome: JobOutcome,
    body: Option<Box<dyn JobBody>>,
}

pub type BatchCompleteFn = dyn FnOnce(&BatchReport) + Send + 'static;

#[derive(Default)]
pub struct SchedulerOptions {
    console: Option<Console>,
    progress: Option<Sender<ProgressEvent>>,
    on_batch_complete: Option<Box<BatchCompleteFn>>,
}

pub struct JobScheduler {
    jobs: Vec<Job>,
    concurrency_limit: usize,
    next_index: usize,
    counts: JobCounts,
    cancel: CancelToken,
    fatal: bool,
    terminal: bool,
    report: Option<BatchReport>,
    started_at: Instant,
    console: Console,
    mirror_job_output: bool,
    progress: Option<Sender<ProgressEvent>>,
    on_batch_complete: Option<Box<BatchCompleteFn>>,
    dispatcher: Dispatcher<JobScheduler>,
}

const BANNER: &str = "=========================================================================";

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.finished + self.aborted
    }

    /// Jobs that have left the queue.
    pub fn admitted(&self) -> usize {
        self.running + self.finished + self.aborted
    }
}

impl TerminalClassification {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalClassification::AllSucceeded)
    }
}

impl BatchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BatchStatus::Ongoing => "Status: ONGOING",
            BatchStatus::OngoingWithErrors => {
                "Status: ONGOING, ENCOUNTERED ERRORS! (See console and log files for details)"
            }
            BatchStatus::Stopping => "Status: STOPPING JOBS ...",
            BatchStatus::Done(TerminalClassification::AllSucceeded) => "Status: DONE!",
            BatchStatus::Done(TerminalClassification::SucceededWithErrors) => {
                "Status: FINISHED WITH ERRORS! (See console and log files for details)"
            }
            BatchStatus::Done(TerminalClassification::Cancelled) => "Status: JOBS STOPPED!",
            BatchStatus::Done(TerminalClassification::Fatal) => "Status: OUT OF MEMORY, JOBS STOPPED!",
        }
    }

    /// Persistent warning or failure state.
    pub fn is_warning(&self) -> bool {
        !matches!(
            self,
            BatchStatus::Ongoing | BatchStatus::Done(TerminalClassification::AllSucceeded)
        )
    }
}

impl JobCompletion {
    pub fn new(id: JobId, outcome: JobOutcome) -> Self {
        JobCompletion { id, outcome, body: None }
    }
}

impl SchedulerOptions {
    /// Where batch-level messages go. Defaults to stdout.
    pub fn console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    /// Publish progress events for a status view.
    pub fn progress(mut self, tx: Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Called exactly once, on the dispatch thread, when the batch is terminal.
    pub fn on_batch_complete(mut self, f: impl FnOnce(&BatchReport) + Send + 'static) -> Self {
        self.on_batch_complete = Some(Box::new(f));
        self
    }
}

impl JobScheduler {
    /// Validate the batch, then admit the first `min(concurrency_limit, jobs.len())`
    /// jobs. Returns without waiting; completions arrive through `dispatcher`.
    pub fn start(
        jobs: Vec<Job>,
        concurrency_limit: usize,
        dispatcher: Dispatcher<JobScheduler>,
        options: SchedulerOptions,
    ) -> Result<JobScheduler, StartError> {
        if jobs.is_empty() {
            return Err(StartError::EmptyBatch);
        }
        if concurrency_limit == 0 {
            return Err(StartError::InvalidConcurrencyLimit(concurrency_limit));
        }
        check_log_files(&jobs)?;

        let total = jobs.len();
        let mut scheduler = JobScheduler {
            jobs,
            concurrency_limit,
            next_index: 0,
            counts: JobCounts {
                queued: total,
                ..Default::default()
            },
            cancel: CancelToken::new(),
            fatal: false,
            terminal: false,
            report: None,
            started_at: Instant::now(),
            console: options.console.unwrap_or_default(),
            // Parallel jobs would interleave on the console; they only write their log files.
            mirror_job_output: concurrency_limit == 1,
            progress: options.progress,
            on_batch_complete: options.on_batch_complete,
            dispatcher,
        };

        tracing::info!("Starting batch of {} with concurrency limit {}", pluralize(total, "job"), concurrency_limit);
        scheduler.print_header();
        scheduler.publish(ProgressEvent::BatchStarted {
            total,
            concurrency_limit,
            snapshot: scheduler.snapshot(),
        });

        for _ in 0..concurrency_limit.min(total) {
            scheduler.admit_next();
        }

        Ok(scheduler)
    }

    /// Start a batch on `queue` and drain the queue on this thread until the
    /// batch is terminal.
    pub fn run_to_completion(
        queue: &DispatchQueue<JobScheduler>,
        jobs: Vec<Job>,
        concurrency_limit: usize,
        options: SchedulerOptions,
    ) -> Result<JobScheduler, StartError> {
        let mut scheduler = JobScheduler::start(jobs, concurrency_limit, queue.dispatcher(), options)?;
        queue.run_until(&mut scheduler, JobScheduler::is_terminal);
        Ok(scheduler)
    }

    /// Stop admitting jobs and ask running jobs to stop at their next log write.
    /// Idempotent. Counts are untouched until the running jobs report back.
    pub fn request_cancel(&mut self) {
        if self.terminal {
            return;
        }

        self.console.println("");
        if self.cancel.cancel() {
            tracing::info!("Cancel requested with {} running", pluralize(self.counts.running, "job"));
            self.console.println("INTERRUPT: Waiting for jobs ...");
            self.publish(ProgressEvent::CancelRequested {
                snapshot: self.snapshot(),
            });
        } else {
            self.console
                .println("Still waiting for jobs to exit gracefully, this can take a minute ...");
        }
    }

    /// Apply one job's outcome. Must run on the dispatch thread.
    pub fn on_job_completed(&mut self, completion: JobCompletion) {
        let JobCompletion { id, outcome, body } = completion;

        match self.jobs.get(id) {
            Some(job) if job.state == JobState::Running => {}
            _ => {
                tracing::warn!("Ignoring completion for job {} which is not running", id);
                return;
            }
        }

        self.counts.running -= 1;
        let stopping = self.is_stopping();

        let job = &mut self.jobs[id];
        if body.is_some() {
            job.body = body;
        }
        let name = job.name().to_owned();

        let new_state = if stopping {
            // Whatever the job managed, the batch was stopped underneath it.
            self.console.println(&format!("Job interrupted: {}", name));
            JobState::Aborted
        } else {
            match &outcome {
                JobOutcome::Success(elapsed) => {
                    job.elapsed = Some(*elapsed);
                    self.console.println(&format!(
                        "Job finished:\t{}\n- Runtime = {}",
                        name,
                        format_duration(*elapsed)
                    ));
                    JobState::Finished
                }
                JobOutcome::Failure(e) => {
                    self.console.println(&format!("\nJOB ABORTED:\t{}\n{:?}", name, e));
                    JobState::Aborted
                }
                JobOutcome::Cancelled => {
                    self.console.println(&format!("Job interrupted: {}", name));
                    JobState::Aborted
                }
                JobOutcome::FatalResourceError(e) => {
                    self.console
                        .println(&format!("\nOUT OF MEMORY ERROR:\t{}\n{:?}", name, e));
                    self.fatal = true;
                    self.cancel.cancel();
                    JobState::Aborted
                }
            }
        };
        job.state = new_state;
        let elapsed = job.elapsed;

        match new_state {
            JobState::Finished => self.counts.finished += 1,
            _ => self.counts.aborted += 1,
        }
        debug_assert!(self.counts_consistent());

        tracing::debug!(
            job = %name,
            outcome = outcome.kind(),
            state = ?new_state,
            "Job completed ({} queued, {} running)",
            self.counts.queued,
            self.counts.running
        );
        self.publish(ProgressEvent::JobCompleted {
            id,
            name,
            state: new_state,
            elapsed,
            snapshot: self.snapshot(),
        });

        if !self.is_stopping() && self.counts.queued > 0 {
            self.admit_next();
        }

        if self.counts.running == 0 && (self.counts.queued == 0 || self.is_stopping()) {
            self.finish();
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn counts(&self) -> JobCounts {
        self.counts
    }

    pub fn status(&self) -> BatchStatus {
        if let Some(report) = &self.report {
            BatchStatus::Done(report.classification)
        } else if self.is_stopping() {
            BatchStatus::Stopping
        } else if self.counts.aborted > 0 {
            BatchStatus::OngoingWithErrors
        } else {
            BatchStatus::Ongoing
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            counts: self.counts,
            status: self.status(),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Set once the batch is terminal.
    pub fn report(&self) -> Option<&BatchReport> {
        self.report.as_ref()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    fn is_stopping(&self) -> bool {
        self.fatal || self.cancel.is_cancelled()
    }

    fn counts_consistent(&self) -> bool {
        self.counts.total() == self.jobs.len()
            && self.counts.running <= self.concurrency_limit
            && self.next_index == self.counts.admitted()
    }

    fn publish(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    fn print_header(&self) {
        let total = self.jobs.len();
        let limit = self.concurrency_limit;
        let header = if limit > total {
            format!(
                "Running: {} ({} out of {} used)",
                pluralize(total, "job"),
                total,
                pluralize(limit, "core")
            )
        } else {
            format!("Running: {} ({} used)", pluralize(total, "job"), pluralize(limit, "core"))
        };
        self.console.println(&header);

        let output_dirs: BTreeSet<&Utf8Path> = self.jobs.iter().map(|j| j.output_dir()).collect();
        for dir in output_dirs {
            self.console.println(&format!("- Output directory: {}", dir));
        }
        self.console.println("");

        if limit > 1 {
            self.console.println(
                "==> NOTE: Using multiple cores, console output of individual jobs turned OFF!\n\
                 ==> See the log files in the output directory instead: <job_name>.log.txt\n",
            );
        }
    }

    /// Move the job at the cursor from Queued to Running and start its worker.
    fn admit_next(&mut self) {
        let id = self.next_index;
        self.next_index += 1;
        self.counts.queued -= 1;
        self.counts.running += 1;
        debug_assert!(self.counts_consistent());

        let (run, body) = {
            let job = &mut self.jobs[id];
            job.state = JobState::Running;
            job.start_time = Some(SystemTime::now());
            let run = JobRun {
                name: job.name().to_owned(),
                output_dir: job.output_dir().to_owned(),
                cancel: self.cancel.clone(),
                console: self.mirror_job_output.then(|| self.console.clone()),
            };
            (run, job.body.take())
        };

        if self.mirror_job_output {
            self.console.println(&format!("\n{}", BANNER));
        }
        self.console.println(&format!("Running job:\t{}", run.name));
        if self.mirror_job_output {
            self.console.println(&format!("{}\n", BANNER));
        }
        tracing::debug!(job = %run.name, "Admitted job {} ({} running)", id, self.counts.running);
        self.publish(ProgressEvent::JobAdmitted {
            id,
            name: run.name.clone(),
            snapshot: self.snapshot(),
        });

        let dispatcher = self.dispatcher.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || {
                let mut body = body;
                let outcome = match body.as_deref_mut() {
                    Some(b) => run.execute(b),
                    None => JobOutcome::Failure(anyhow_loc!("Job {} has no body to run", run.name)),
                };
                let completion = JobCompletion { id, outcome, body };
                if dispatcher
                    .post(move |s: &mut JobScheduler| s.on_job_completed(completion))
                    .is_err()
                {
                    tracing::warn!("Dispatch queue closed before job {} reported back", id);
                }
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn worker for job {}: {}", id, e);
            let completion = JobCompletion::new(
                id,
                JobOutcome::Failure(anyhow::Error::new(e).context("Failed to spawn worker thread")),
            );
            let _ = self
                .dispatcher
                .post(move |s: &mut JobScheduler| s.on_job_completed(completion));
        }
    }

    fn finish(&mut self) {
        if self.terminal {
            return;
        }
        self.terminal = true;

        let classification = if self.fatal {
            TerminalClassification::Fatal
        } else if self.cancel.is_cancelled() {
            TerminalClassification::Cancelled
        } else if self.counts.aborted > 0 {
            TerminalClassification::SucceededWithErrors
        } else {
            TerminalClassification::AllSucceeded
        };
        let report = BatchReport {
            counts: self.counts,
            classification,
            elapsed: self.started_at.elapsed(),
        };
        self.report = Some(report.clone());

        self.console.println("\nDone!");
        self.console.println(self.status().label());
        tracing::info!(
            "Batch finished: {:?} ({} finished, {} aborted, {} never started) in {}",
            classification,
            report.counts.finished,
            report.counts.aborted,
            report.counts.queued,
            format_duration(report.elapsed)
        );

        if let Some(on_complete) = self.on_batch_complete.take() {
            on_complete(&report);
        }
        self.publish(ProgressEvent::BatchFinished {
            report,
            snapshot: self.snapshot(),
        });
    }
}

/// Every job needs a log file of its own. Concurrent jobs sharing one would
/// truncate and interleave each other's output.
fn check_log_files(jobs: &[Job]) -> Result<(), StartError> {
    let mut seen = HashSet::new();
    for (index, job) in jobs.iter().enumerate() {
        if job.name().is_empty() {
            return Err(StartError::EmptyJobName { index });
        }
        let path = job.log_file_path();
        if seen.contains(&path) {
            return Err(StartError::DuplicateLogFile { path });
        }
        seen.insert(path);
    }
    Ok(())
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.jobs)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("next_index", &self.next_index)
            .field("counts", &self.counts)
            .field("cancel_requested", &self.cancel.is_cancelled())
            .field("fatal", &self.fatal)
            .field("terminal", &self.terminal)
            .finish()
    }
}
