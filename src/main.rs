use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use magnum_jobs::anyhow_loc;
use magnum_jobs::config::BatchConfig;
use magnum_jobs::dispatch::{DispatchQueue, Dispatcher};
use magnum_jobs::logging::{init_logging, LogFormat, LogLevel};
use magnum_jobs::scheduler::{JobScheduler, SchedulerOptions};
use magnum_jobs::status::StatusDisplay;
use std::io::{BufRead, IsTerminal};
use std::process::ExitCode;

/// Run a batch of analysis jobs with a bounded number running at once.
///
/// Type `stop` (or `q`) and press enter to stop the batch: running jobs end at
/// their next output line and queued jobs are never started.
#[derive(Debug, Parser)]
#[command(name = "magnum-jobs", version)]
struct Cli {
    /// Batch file (JSON)
    config: Utf8PathBuf,

    /// Number of jobs to run at once. Overrides the batch file.
    #[arg(short = 'j', long)]
    cores: Option<usize>,

    /// Where job log files are written. Overrides the batch file.
    #[arg(short, long)]
    output_dir: Option<Utf8PathBuf>,

    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// pretty, json, compact or simple
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Don't print status lines while the batch runs
    #[arg(long)]
    no_status: bool,
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = BatchConfig::load(&cli.config)?;
    if let Some(cores) = cli.cores {
        config.cores = Some(cores);
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    config.validate()?;

    let _log_guard = init_logging(&config.log)?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create output directory {}", config.output_dir))?;

    let queue = DispatchQueue::<JobScheduler>::new();
    spawn_stop_listener(queue.dispatcher());

    let status = (!cli.no_status).then(|| StatusDisplay::new(std::io::stdout().is_terminal()));
    let mut options = SchedulerOptions::default();
    if let Some(status) = &status {
        options = options.progress(status.sender());
    }

    let scheduler = JobScheduler::run_to_completion(&queue, config.build_jobs(), config.cores(), options)?;
    if let Some(status) = status {
        status.shutdown();
    }

    let report = scheduler
        .report()
        .ok_or_else(|| anyhow_loc!("batch ended without a report"))?;
    tracing::debug!("Final counts: {:?}", report.counts);

    if report.classification.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Watch stdin for a stop command and forward it to the scheduler. The thread
/// is left detached; it ends with the process.
fn spawn_stop_listener(dispatcher: Dispatcher<JobScheduler>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match line.trim().to_lowercase().as_str() {
                "stop" | "q" | "quit" => {
                    if dispatcher.post(|s: &mut JobScheduler| s.request_cancel()).is_err() {
                        break;
                    }
                }
                "" => {}
                other => eprintln!("Unknown command '{}'. Type 'stop' to stop the batch.", other),
            }
        }
    });
}
