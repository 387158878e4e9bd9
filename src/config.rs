//! Batch file loading.
//!
//! ```json
//! {
//!     "output_dir": "out",
//!     "cores": 4,
//!     "log": { "level": "info" },
//!     "jobs": [
//!         { "name": "network A", "program": "./analyse", "args": ["--net", "a.xml"] }
//!     ]
//! }
//! ```
//!
//! Relative paths (`output_dir`, a job's `working_dir`) resolve against the
//! directory holding the batch file.

use crate::bail_loc;
use crate::command_job::CommandJob;
use crate::job::Job;
use crate::logging::LogConfig;
use crate::util::sanitize_job_name;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    pub output_dir: Utf8PathBuf,

    /// Concurrency limit. Defaults to the number of logical CPUs.
    #[serde(default)]
    pub cores: Option<usize>,

    #[serde(default)]
    pub log: LogConfig,

    pub jobs: Vec<JobEntry>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobEntry {
    pub name: String,
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<Utf8PathBuf>,
}

impl BatchConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<BatchConfig> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read batch file {}", path))?;
        let mut config =
            BatchConfig::from_json(&text).with_context(|| format!("Failed to parse batch file {}", path))?;

        let base = path.parent().unwrap_or_else(|| Utf8Path::new(""));
        config.resolve_paths(base);
        config.validate().with_context(|| format!("Invalid batch file {}", path))?;
        Ok(config)
    }

    /// Parse without touching the filesystem. Paths are left as written.
    pub fn from_json(text: &str) -> anyhow::Result<BatchConfig> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jobs.is_empty() {
            bail_loc!("batch has no jobs");
        }
        if self.cores == Some(0) {
            bail_loc!("cores must be at least 1");
        }

        // Log files are named after the sanitized job name.
        let mut seen: HashMap<String, &str> = HashMap::new();
        for entry in &self.jobs {
            if entry.name.trim().is_empty() {
                bail_loc!("job with program '{}' has an empty name", entry.program);
            }
            if entry.program.trim().is_empty() {
                bail_loc!("job '{}' has an empty program", entry.name);
            }
            let file_name = sanitize_job_name(&entry.name);
            if let Some(previous) = seen.insert(file_name.clone(), &entry.name) {
                bail_loc!(
                    "jobs '{}' and '{}' would both log to {}.log.txt",
                    previous,
                    entry.name,
                    file_name
                );
            }
        }
        Ok(())
    }

    pub fn cores(&self) -> usize {
        self.cores.unwrap_or_else(num_cpus::get)
    }

    /// One [`CommandJob`] per entry, all writing to `output_dir`.
    pub fn build_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .map(|entry| Job::new(&entry.name, self.output_dir.clone(), entry.to_command()))
            .collect()
    }

    fn resolve_paths(&mut self, base: &Utf8Path) {
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
        for entry in &mut self.jobs {
            if let Some(dir) = &mut entry.working_dir {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
    }
}

impl JobEntry {
    pub fn to_command(&self) -> CommandJob {
        let mut cmd = CommandJob::new(&self.program).args(self.args.iter().cloned());
        cmd.env = self.env.clone();
        cmd.working_dir = self.working_dir.clone();
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_err, assert_ok};
    use crate::job::JobState;
    use crate::logging::LogLevel;
    use crate::test_utils::{tmp_dir, tmp_utf8};

    const MINIMAL: &str = r#"{
        "output_dir": "out",
        "jobs": [ { "name": "net a", "program": "analyse" } ]
    }"#;

    #[test]
    fn minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = BatchConfig::from_json(MINIMAL)?;
        config.validate()?;

        assert_eq!(config.output_dir, Utf8PathBuf::from("out"));
        assert_eq!(config.cores, None);
        assert_eq!(config.cores(), num_cpus::get());
        assert_eq!(config.log, LogConfig::default());
        assert!(config.jobs[0].args.is_empty());
        assert!(config.jobs[0].env.is_empty());
        Ok(())
    }

    #[test]
    fn full_config() -> anyhow::Result<()> {
        let config = BatchConfig::from_json(
            r#"{
                "output_dir": "/data/out",
                "cores": 3,
                "log": { "level": "debug" },
                "jobs": [
                    {
                        "name": "first",
                        "program": "analyse",
                        "args": ["--net", "a.xml"],
                        "env": { "MAGNUM_SEED": "7" },
                        "working_dir": "/data"
                    },
                    { "name": "second", "program": "analyse" }
                ]
            }"#,
        )?;
        config.validate()?;

        assert_eq!(config.cores(), 3);
        assert_eq!(config.log.level, LogLevel::Debug);

        let cmd = config.jobs[0].to_command();
        assert_eq!(cmd.command_display(), "analyse --net a.xml");
        assert_eq!(cmd.env.get("MAGNUM_SEED").map(String::as_str), Some("7"));
        assert_eq!(cmd.working_dir, Some(Utf8PathBuf::from("/data")));

        let jobs = config.build_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].name(), "second");
        assert_eq!(jobs[1].output_dir(), Utf8Path::new("/data/out"));
        assert_eq!(jobs[1].state(), JobState::Queued);
        assert_eq!(
            jobs[0].body_as::<CommandJob>().map(|c| c.args.clone()),
            Some(vec!["--net".to_owned(), "a.xml".to_owned()])
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_fields() {
        assert_err!(BatchConfig::from_json(
            r#"{ "output_dir": "out", "threads": 2, "jobs": [] }"#
        ));
        assert_err!(BatchConfig::from_json(
            r#"{ "output_dir": "out", "jobs": [ { "name": "a", "program": "x", "cmd": "y" } ] }"#
        ));
    }

    #[test]
    fn validation_errors() -> anyhow::Result<()> {
        let empty = BatchConfig::from_json(r#"{ "output_dir": "out", "jobs": [] }"#)?;
        assert_err!(empty.validate());

        let mut zero_cores = BatchConfig::from_json(MINIMAL)?;
        zero_cores.cores = Some(0);
        assert_err!(zero_cores.validate());
        zero_cores.cores = Some(1);
        assert_ok!(zero_cores.validate());

        let colliding = BatchConfig::from_json(
            r#"{ "output_dir": "out", "jobs": [
                { "name": "net a", "program": "x" },
                { "name": "net_a", "program": "y" }
            ] }"#,
        )?;
        let err = colliding.validate().unwrap_err();
        assert!(err.to_string().contains("net_a.log.txt"), "{}", err);

        let no_program = BatchConfig::from_json(
            r#"{ "output_dir": "out", "jobs": [ { "name": "a", "program": " " } ] }"#,
        )?;
        assert_err!(no_program.validate());
        Ok(())
    }

    #[test]
    fn load_resolves_relative_paths() -> anyhow::Result<()> {
        let dir = tmp_dir();
        let root = tmp_utf8(&dir);
        let path = root.join("batch.json");
        std::fs::write(
            &path,
            r#"{
                "output_dir": "results",
                "jobs": [
                    { "name": "a", "program": "x", "working_dir": "inputs" },
                    { "name": "b", "program": "x", "working_dir": "/abs" }
                ]
            }"#,
        )?;

        let config = BatchConfig::load(&path)?;
        assert_eq!(config.output_dir, root.join("results"));
        assert_eq!(config.jobs[0].working_dir, Some(root.join("inputs")));
        assert_eq!(config.jobs[1].working_dir, Some(Utf8PathBuf::from("/abs")));
        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tmp_dir();
        let err = BatchConfig::load(&tmp_utf8(&dir).join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read batch file"));
    }
}
