use camino::Utf8PathBuf;
use thiserror::Error;

/// Reasons a batch could not be started. These are programming errors in the
/// caller and are reported synchronously, before any job is admitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("cannot start a batch with an empty job list")]
    EmptyBatch,

    #[error("concurrency limit must be at least 1 (got {0})")]
    InvalidConcurrencyLimit(usize),

    #[error("job {index} has an empty name")]
    EmptyJobName { index: usize },

    #[error("more than one job would write the log file {path}")]
    DuplicateLogFile { path: Utf8PathBuf },
}

/// Raised by a logger checkpoint once the batch has been asked to stop.
#[derive(Debug, Error)]
#[error("job '{job}' was interrupted")]
pub struct Cancelled {
    pub job: String,
}

/// An unrecoverable resource condition (out of memory or equivalent). Job
/// bodies return this to stop the whole batch.
#[derive(Debug, Error)]
#[error("resource exhausted: {reason}")]
pub struct ResourceExhausted {
    pub reason: String,
}

impl ResourceExhausted {
    pub fn new(reason: impl Into<String>) -> Self {
        ResourceExhausted { reason: reason.into() }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("dispatch queue is closed")]
pub struct DispatchClosed;

#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .expect("Short function name")
    }};
}

#[macro_export]
macro_rules! bail_loc {
    ($msg:expr) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! anyhow_loc {
    ($msg:expr) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), $crate::function_name!(), line!(), format!($fmt, $($arg)*))
    };
}
