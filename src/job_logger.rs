//! Output sinks for running jobs.
//!
//! A [`JobLogger`] belongs to one job. It writes to the job's own log file
//! and, optionally, to a [`Console`] shared by the whole batch. With interrupt
//! checking enabled every write is also a cancellation checkpoint: once the
//! batch's [`CancelToken`] is raised the write fails with [`Cancelled`].

use crate::error::Cancelled;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ----------------------------------------------------------------------------
// CancelToken
// ----------------------------------------------------------------------------

/// Batch-wide stop switch. Monotonic: once raised it stays raised.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns true if this call raised the token.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Console
// ----------------------------------------------------------------------------

enum ConsoleTarget {
    Stdout,
    Memory(String),
}

/// The shared console view. Each write appends the whole text under one lock,
/// so concurrent writers interleave by write and never tear a line.
#[derive(Clone)]
pub struct Console {
    target: Arc<Mutex<ConsoleTarget>>,
}

impl Console {
    pub fn stdout() -> Self {
        Console {
            target: Arc::new(Mutex::new(ConsoleTarget::Stdout)),
        }
    }

    /// A console that keeps everything written to it; see [`Console::contents`].
    pub fn in_memory() -> Self {
        Console {
            target: Arc::new(Mutex::new(ConsoleTarget::Memory(String::new()))),
        }
    }

    pub fn print(&self, text: &str) {
        let mut target = lock_ignoring_poison(&self.target);
        match &mut *target {
            ConsoleTarget::Stdout => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            ConsoleTarget::Memory(buf) => buf.push_str(text),
        }
    }

    pub fn println(&self, text: &str) {
        self.print(&format!("{}\n", text));
    }

    /// Everything written so far. Always empty for a stdout console.
    pub fn contents(&self) -> String {
        match &*lock_ignoring_poison(&self.target) {
            ConsoleTarget::Stdout => String::new(),
            ConsoleTarget::Memory(buf) => buf.clone(),
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::stdout()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*lock_ignoring_poison(&self.target) {
            ConsoleTarget::Stdout => "stdout",
            ConsoleTarget::Memory(_) => "memory",
        };
        f.debug_struct("Console").field("target", &kind).finish()
    }
}

// ----------------------------------------------------------------------------
// JobLogger
// ----------------------------------------------------------------------------

struct LogFile {
    path: Utf8PathBuf,
    writer: BufWriter<File>,
}

pub struct JobLogger {
    job_name: String,
    cancel: CancelToken,
    check_interrupt: AtomicBool,
    console: Option<Console>,
    log_file: Mutex<Option<LogFile>>,
}

impl JobLogger {
    pub fn new(job_name: impl Into<String>, cancel: CancelToken) -> Self {
        JobLogger {
            job_name: job_name.into(),
            cancel,
            check_interrupt: AtomicBool::new(false),
            console: None,
            log_file: Mutex::new(None),
        }
    }

    /// Also mirror every write to the shared console.
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn set_check_interrupt(&self, check: bool) {
        self.check_interrupt.store(check, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write `text` to every output. This is the cancellation checkpoint.
    pub fn print(&self, text: &str) -> Result<(), Cancelled> {
        if self.check_interrupt.load(Ordering::SeqCst) && self.cancel.is_cancelled() {
            self.print_all("\nJOB INTERRUPTED!\n");
            return Err(Cancelled {
                job: self.job_name.clone(),
            });
        }

        self.print_all(text);
        Ok(())
    }

    pub fn println(&self, text: &str) -> Result<(), Cancelled> {
        self.print(&format!("{}\n", text))
    }

    /// Open (truncating) the job's log file. Any file opened before is closed first.
    pub fn create_log_file(&self, path: &Utf8Path) -> std::io::Result<()> {
        let file = File::create(path.as_std_path())?;
        let previous = lock_ignoring_poison(&self.log_file).replace(LogFile {
            path: path.to_owned(),
            writer: BufWriter::new(file),
        });
        if let Some(mut previous) = previous {
            previous.writer.flush()?;
        }
        Ok(())
    }

    /// Flush and close the log file. Returns the path that was closed, or
    /// `None` if no file was open.
    pub fn close_log_file(&self) -> std::io::Result<Option<Utf8PathBuf>> {
        match lock_ignoring_poison(&self.log_file).take() {
            Some(mut log_file) => {
                log_file.writer.flush()?;
                let LogFile { path, writer } = log_file;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    pub fn has_open_log_file(&self) -> bool {
        lock_ignoring_poison(&self.log_file).is_some()
    }

    fn print_all(&self, text: &str) {
        if let Some(console) = &self.console {
            console.print(text);
        }

        if let Some(log_file) = lock_ignoring_poison(&self.log_file).as_mut() {
            if let Err(e) = log_file.writer.write_all(text.as_bytes()) {
                tracing::warn!("Failed to write to log file {}: {}", log_file.path, e);
            }
        }
    }
}

impl Drop for JobLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close_log_file() {
            tracing::warn!("Failed to close log file of job {}: {}", self.job_name, e);
        }
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
