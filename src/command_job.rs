//! A job body that runs an external program and streams its output through
//! the job's logger, one line per write.

use crate::bail_loc;
use crate::error::ResourceExhausted;
use crate::job::JobBody;
use crate::job_logger::JobLogger;
use anyhow::Context;
use camino::Utf8PathBuf;
use crossbeam::channel::Sender;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandJob {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<Utf8PathBuf>,

    /// Set once the process has exited on its own.
    pub exit_code: Option<i32>,
    pub lines_logged: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl CommandJob {
    pub fn new(program: impl Into<String>) -> Self {
        CommandJob {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command_display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn()
            .with_context(|| format!("Failed to execute command: {}", self.command_display()))
    }
}

impl JobBody for CommandJob {
    fn run(&mut self, log: &JobLogger) -> anyhow::Result<()> {
        let command_display = self.command_display();
        tracing::trace!("Executing command: {command_display}");
        log.println(&format!("$ {}", command_display))?;

        self.exit_code = None;
        self.lines_logged = 0;
        let mut child = self.spawn()?;

        // Both pipes feed one channel so lines are logged in arrival order.
        let (line_tx, line_rx) = crossbeam::channel::unbounded::<(Stream, String)>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        for (stream, line) in line_rx.iter() {
            let written = match stream {
                Stream::Stdout => log.println(&line),
                Stream::Stderr => log.println(&format!("[stderr] {}", line)),
            };
            if let Err(cancelled) = written {
                tracing::debug!("Stopping '{}' for {}", command_display, log.job_name());
                let _ = child.kill();
                let _ = child.wait();
                return Err(cancelled.into());
            }
            self.lines_logged += 1;
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for command: {}", command_display))?;
        self.exit_code = status.code();

        if status.success() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            // SIGKILL from outside is almost always the kernel's OOM killer.
            if status.signal() == Some(9) {
                return Err(ResourceExhausted::new(format!(
                    "'{}' was killed by SIGKILL (out of memory?)",
                    command_display
                ))
                .into());
            }
        }

        match status.code() {
            Some(code) => bail_loc!("Command '{}' exited with code {}", command_display, code),
            None => bail_loc!("Command '{}' terminated by signal ({})", command_display, status),
        }
    }
}

/// Detached reader thread for one pipe. It ends at EOF, which only comes once
/// every process holding the write end has exited: after a cancel kills the
/// direct child, a grandchild (e.g. a program started by `sh -c`) keeps the
/// thread parked until that grandchild exits too. Nothing waits on it.
fn forward_lines(pipe: impl Read + Send + 'static, stream: Stream, tx: Sender<(Stream, String)>) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_owned();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Cancelled;
    use crate::job_logger::{CancelToken, Console};
    use crate::test_utils::{tmp_dir, tmp_utf8};
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandJob {
        CommandJob::new("sh").arg("-c").arg(script)
    }

    fn logger(console: &Console) -> JobLogger {
        let log = JobLogger::new("cmd", CancelToken::new()).with_console(console.clone());
        log.set_check_interrupt(true);
        log
    }

    #[test]
    fn streams_stdout_and_stderr() -> anyhow::Result<()> {
        let console = Console::in_memory();
        let mut job = sh("echo one; echo two 1>&2; echo three");
        job.run(&logger(&console))?;

        let text = console.contents();
        assert!(text.starts_with("$ sh -c echo one;"));
        assert!(text.contains("one\n"));
        assert!(text.contains("[stderr] two\n"));
        assert!(text.contains("three\n"));
        assert_eq!(job.lines_logged, 3);
        assert_eq!(job.exit_code, Some(0));
        Ok(())
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let console = Console::in_memory();
        let mut job = sh("echo partial; exit 3");
        let err = job.run(&logger(&console)).unwrap_err();

        assert!(err.to_string().contains("exited with code 3"), "{:#}", err);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.lines_logged, 1);
    }

    #[test]
    fn env_and_working_dir_are_applied() -> anyhow::Result<()> {
        let dir = tmp_dir();
        let console = Console::in_memory();
        let mut job = sh("echo \"$GREETING\"; pwd")
            .env("GREETING", "hello")
            .working_dir(tmp_utf8(&dir));
        job.run(&logger(&console))?;

        let text = console.contents();
        assert!(text.contains("hello\n"));
        let canonical = std::fs::canonicalize(dir.path())?;
        assert!(
            text.contains(tmp_utf8(&dir).as_str()) || text.contains(&*canonical.to_string_lossy()),
            "{}",
            text
        );
        Ok(())
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let console = Console::in_memory();
        let mut job = CommandJob::new("definitely-not-a-real-program-7f3a");
        let err = job.run(&logger(&console)).unwrap_err();
        assert!(err.to_string().contains("Failed to execute command"));
        assert_eq!(job.exit_code, None);
    }

    #[test]
    fn cancel_kills_the_process_at_next_line() {
        let cancel = CancelToken::new();
        let console = Console::in_memory();
        let log = JobLogger::new("cmd", cancel.clone()).with_console(console.clone());
        log.set_check_interrupt(true);

        let mut job = sh("echo first; sleep 1; echo second; sleep 30; echo never");
        let t0 = Instant::now();
        let handle = std::thread::spawn(move || {
            let result = job.run(&log);
            (result, job)
        });

        while !console.contents().contains("\nfirst\n") {
            assert!(t0.elapsed() < Duration::from_secs(10), "first line never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        let (result, job) = handle.join().unwrap();

        let err = result.unwrap_err();
        assert!(err.chain().any(|c| c.is::<Cancelled>()));
        assert_eq!(job.exit_code, None);
        assert_eq!(job.lines_logged, 1);
        assert!(console.contents().contains("JOB INTERRUPTED!"));
        assert!(!console.contents().contains("\nsecond\n"));
        assert!(t0.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn sigkill_is_reported_as_resource_exhaustion() {
        let console = Console::in_memory();
        let mut job = sh("kill -9 $$");
        let err = job.run(&logger(&console)).unwrap_err();
        assert!(err.chain().any(|c| c.is::<ResourceExhausted>()), "{:#}", err);
    }
}
