//! The external batch queue the dispatcher submits jobs to.

use crate::tool::ToolCall;
use crate::utils::shell_join;
use anyhow::{Context, Result};
use log::debug;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One job handed to the queue.
#[derive(Debug, Clone)]
pub struct QueueSubmission {
    /// `{group}_{index}`.
    pub job_name: String,
    pub queue: String,
    /// Where the queue writes the job's output.
    pub log_path: PathBuf,
    pub command: Vec<OsString>,
}

pub trait JobQueue {
    /// Hand a job to the queue. An error means the queue rejected it.
    fn submit(&self, submission: &QueueSubmission) -> Result<()>;

    /// Number of jobs of `group` that have not finished yet.
    fn count(&self, group: &str, queue: &str) -> Result<usize>;

    /// The command line that would submit this job.
    fn describe(&self, submission: &QueueSubmission) -> String;
}

/// IBM Spectrum LSF, driven through `bsub` and `bjobs`.
#[derive(Debug, Clone)]
pub struct LsfQueue {
    bsub: PathBuf,
    bjobs: PathBuf,
}

impl Default for LsfQueue {
    fn default() -> Self {
        LsfQueue::new("bsub", "bjobs")
    }
}

impl LsfQueue {
    pub fn new(bsub: impl Into<PathBuf>, bjobs: impl Into<PathBuf>) -> Self {
        LsfQueue {
            bsub: bsub.into(),
            bjobs: bjobs.into(),
        }
    }

    /// The remote shell re-parses the job command, so it is passed to
    /// `bsub` as one quoted string.
    fn submit_call(&self, submission: &QueueSubmission) -> ToolCall {
        ToolCall::new(&self.bsub)
            .args([
                "-J",
                submission.job_name.as_str(),
                "-q",
                submission.queue.as_str(),
                "-o",
            ])
            .arg(&submission.log_path)
            .arg(shell_join(&submission.command))
    }
}

impl JobQueue for LsfQueue {
    fn submit(&self, submission: &QueueSubmission) -> Result<()> {
        let working_dir = submission.log_path.parent().unwrap_or(Path::new("."));
        self.submit_call(submission)
            .invoke(working_dir)
            .with_context(|| format!("LSF rejected job {}", submission.job_name))
    }

    fn count(&self, group: &str, queue: &str) -> Result<usize> {
        let pattern = format!("{group}_*");
        let output = Command::new(&self.bjobs)
            .args(["-J", pattern.as_str(), "-q", queue])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("unable to run {}", self.bjobs.display()))?;
        if !output.status.success() {
            // bjobs exits non-zero when no job matches.
            debug!(
                "bjobs exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(0);
        }
        Ok(parse_bjobs_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn describe(&self, submission: &QueueSubmission) -> String {
        self.submit_call(submission).to_string()
    }
}

/// Count the job lines of a `bjobs` listing.
pub fn parse_bjobs_output(stdout: &str) -> usize {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("JOBID"))
        .count()
}
