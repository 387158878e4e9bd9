use crate::job::{JobId, JobState};
use crate::scheduler::{BatchReport, BatchStatus, JobCounts, StatusSnapshot, TerminalClassification};
use crate::util::{format_duration, pluralize};
use crossbeam::channel::{Receiver, Sender};
use std::io::Write;
use std::time::Duration;

// ANSI color codes.
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const GRAY: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const BAR_WIDTH: usize = 24;

// ----------------------------------------------------------------------------
// Events published by the scheduler (always from the dispatch thread)
// ----------------------------------------------------------------------------
#[derive(Debug)]
pub enum ProgressEvent {
    BatchStarted {
        total: usize,
        concurrency_limit: usize,
        snapshot: StatusSnapshot,
    },
    JobAdmitted {
        id: JobId,
        name: String,
        snapshot: StatusSnapshot,
    },
    JobCompleted {
        id: JobId,
        name: String,
        state: JobState,
        elapsed: Option<Duration>,
        snapshot: StatusSnapshot,
    },
    CancelRequested {
        snapshot: StatusSnapshot,
    },
    BatchFinished {
        report: BatchReport,
        snapshot: StatusSnapshot,
    },
    Shutdown,
}

// ----------------------------------------------------------------------------
// StatusDisplay
// ----------------------------------------------------------------------------

/// Passive status view: prints a counts line whenever the scheduler reports a
/// change, then a summary once the batch is over.
pub struct StatusDisplay {
    event_tx: Sender<ProgressEvent>,
    render_thread: Option<std::thread::JoinHandle<()>>,
}

impl StatusDisplay {
    pub fn new(use_color: bool) -> Self {
        Self::with_writer(use_color, std::io::stdout())
    }

    pub fn with_writer(use_color: bool, out: impl Write + Send + 'static) -> Self {
        let (event_tx, event_rx) = crossbeam::channel::unbounded::<ProgressEvent>();
        let render_thread = Some(std::thread::spawn(move || {
            render_loop(event_rx, use_color, out);
        }));

        StatusDisplay {
            event_tx,
            render_thread,
        }
    }

    pub fn sender(&self) -> Sender<ProgressEvent> {
        self.event_tx.clone()
    }

    /// Render whatever is still queued, then join the render thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.render_thread.take() {
            let _ = self.event_tx.send(ProgressEvent::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for StatusDisplay {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn render_loop(event_rx: Receiver<ProgressEvent>, use_color: bool, mut out: impl Write) {
    let mut total = 0;

    for event in event_rx.iter() {
        let lines = match event {
            ProgressEvent::Shutdown => break,
            ProgressEvent::BatchStarted {
                total: batch_total,
                snapshot,
                ..
            } => {
                total = batch_total;
                vec![render_status_line(&snapshot, total, use_color)]
            }
            ProgressEvent::JobAdmitted { snapshot, .. }
            | ProgressEvent::JobCompleted { snapshot, .. }
            | ProgressEvent::CancelRequested { snapshot } => {
                vec![render_status_line(&snapshot, total, use_color)]
            }
            ProgressEvent::BatchFinished { report, snapshot } => vec![
                render_status_line(&snapshot, total, use_color),
                render_final_summary(&report, use_color),
            ],
        };

        for line in lines {
            let _ = writeln!(out, "{}", line);
        }
        let _ = out.flush();
    }
}

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

/// Four-segment bar: finished `█`, aborted `▓`, running `▒`, queued `░`.
pub fn render_counts_bar(counts: &JobCounts, width: usize) -> String {
    let total = counts.total();
    if total == 0 {
        return format!("[{}]", "░".repeat(width));
    }

    let cells = |n: usize| (n * width + total / 2) / total;
    let finished = cells(counts.finished);
    let aborted = cells(counts.aborted).min(width - finished);
    let running = cells(counts.running).min(width - finished - aborted);
    let queued = width - finished - aborted - running;

    format!(
        "[{}{}{}{}]",
        "█".repeat(finished),
        "▓".repeat(aborted),
        "▒".repeat(running),
        "░".repeat(queued)
    )
}

fn status_color(status: &BatchStatus) -> &'static str {
    match status {
        BatchStatus::Ongoing => BLUE,
        BatchStatus::OngoingWithErrors => YELLOW,
        BatchStatus::Stopping => RED,
        BatchStatus::Done(TerminalClassification::AllSucceeded) => GREEN,
        BatchStatus::Done(_) => RED,
    }
}

pub fn render_status_line(snapshot: &StatusSnapshot, total: usize, use_color: bool) -> String {
    let c = &snapshot.counts;
    let bar = render_counts_bar(c, BAR_WIDTH);
    let done = c.finished + c.aborted;
    let counts = format!(
        "{}/{} | {} queued | {} running | {} finished | {} aborted",
        done, total, c.queued, c.running, c.finished, c.aborted
    );
    let label = snapshot.status.label();

    if use_color {
        format!(
            " {} {GRAY}{}{RESET} {}{}{RESET}",
            bar,
            counts,
            status_color(&snapshot.status),
            label
        )
    } else {
        format!(" {} {} {}", bar, counts, label)
    }
}

pub fn render_final_summary(report: &BatchReport, use_color: bool) -> String {
    let (color, verb) = match report.classification {
        TerminalClassification::AllSucceeded => (GREEN, "Finished"),
        TerminalClassification::SucceededWithErrors => (YELLOW, "Finished"),
        TerminalClassification::Cancelled => (RED, "Stopped"),
        TerminalClassification::Fatal => (RED, "Failed"),
    };
    let c = &report.counts;
    let mut detail = format!("{} finished", pluralize(c.finished, "job"));
    if c.aborted > 0 {
        detail.push_str(&format!(", {} aborted", c.aborted));
    }
    if c.queued > 0 {
        detail.push_str(&format!(", {} never started", c.queued));
    }
    let elapsed = format_duration(report.elapsed);

    if use_color {
        format!("{color}{:>10}{RESET} {} in {}", verb, detail, elapsed)
    } else {
        format!("{:>10} {} in {}", verb, detail, elapsed)
    }
}
