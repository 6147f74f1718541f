//! Fan the per-sample pipeline out over a batch of input tables.
//!
//! Jobs either run one after another in this process, or are submitted to an
//! external [`JobQueue`]. In queue mode the dispatcher throttles itself by
//! polling the number of unfinished jobs of its job group after every
//! submission, and waits for the group to drain before reporting.

use crate::pipeline::{Pipeline, PipelineArgs, Stage};
use crate::queue::{JobQueue, QueueSubmission};
use crate::queue_args::QueueArgs;
use crate::sample::{Sample, Separator};
use crate::utils::shell_join;
use anyhow::{bail, ensure, Context, Result};
use log::{debug, info, warn};
use mainiac_aggr::{merge_tables, AggregationError, MergeOptions, MergedDataset};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;

/// Name of the batch report written to the output directory.
pub const REPORT_FILE: &str = "batch_report.json";

pub const DEFAULT_PATTERN: &str = "*.tsv";

/// Where and how to find the samples of a batch.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// One input table, or a directory of them.
    pub input: PathBuf,
    /// Glob applied to a directory input.
    pub pattern: String,
    pub output_dir: PathBuf,
    pub seq_col: String,
    pub separator: Separator,
    /// Passed on to every job.
    pub tools_json: Option<PathBuf>,
}

/// Input tables of a batch in job index order.
pub fn discover_samples(input: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("{} is neither a file nor a directory", input.display());
    }
    let dir = input
        .to_str()
        .with_context(|| format!("{} is not valid UTF-8", input.display()))?;
    let full_pattern = format!("{}/{pattern}", glob::Pattern::escape(dir));
    let mut paths = Vec::new();
    for entry in glob::glob(&full_pattern).with_context(|| format!("invalid pattern {pattern}"))? {
        let path = entry?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    ensure!(
        !paths.is_empty(),
        "no files matching {pattern} in {}",
        input.display()
    );
    Ok(paths)
}

/// One sample bound to its Output Table.
#[derive(Debug, Clone)]
pub struct Job {
    /// Position of the sample in discovery order.
    pub index: usize,
    pub sample: Sample,
    pub output: PathBuf,
    /// Output of the job when it runs on the queue.
    pub log: PathBuf,
}

impl Job {
    fn new(index: usize, sample: Sample, output_dir: &Path) -> Job {
        let output = output_dir.join(format!("{}.out.csv", sample.name()));
        let log = output_dir.join(format!("job_{index}.out"));
        Job {
            index,
            sample,
            output,
            log,
        }
    }

    /// The `mainiac run` command that performs this job in another process.
    pub fn command(
        &self,
        executable: &Path,
        args: &PipelineArgs,
        tools_json: Option<&Path>,
    ) -> Vec<OsString> {
        let mut command: Vec<OsString> = vec![
            executable.into(),
            "run".into(),
            "--source-file".into(),
            self.sample.source.clone().into(),
            "--seq-col-name".into(),
            self.sample.seq_col.clone().into(),
            "--sep".into(),
            self.sample.separator.to_string().into(),
            "--ref-v".into(),
            args.ref_v.clone().into(),
            "--ref-j".into(),
            args.ref_j.clone().into(),
            "--output-file".into(),
            self.output.clone().into(),
        ];
        if args.keep_temp {
            command.push("--keep-temp".into());
        }
        if args.keep_align {
            command.push("--keep-align".into());
        }
        if let Some(temp_root) = &args.temp_root {
            command.push("--temp-dir".into());
            command.push(temp_root.clone().into());
        }
        if let Some(tools_json) = tools_json {
            command.push("--tools-json".into());
            command.push(tools_json.into());
        }
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed {
        stage: Option<Stage>,
        exit_code: Option<i32>,
        error: String,
    },
    /// Handed to the queue, outcome not known yet.
    Submitted,
    Rejected {
        error: String,
    },
    Previewed {
        command: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub index: usize,
    pub sample: PathBuf,
    pub output: PathBuf,
    #[serde(flatten)]
    pub status: JobStatus,
}

impl JobOutcome {
    fn new(job: &Job, status: JobStatus) -> Self {
        JobOutcome {
            index: job.index,
            sample: job.sample.source.clone(),
            output: job.output.clone(),
            status,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Failed { .. } | JobStatus::Rejected { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_group: String,
    pub jobs: Vec<JobOutcome>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.jobs
            .iter()
            .all(|job| job.status == JobStatus::Succeeded)
    }

    pub fn failed(&self) -> Vec<&JobOutcome> {
        self.jobs.iter().filter(|job| job.is_failure()).collect()
    }

    /// Output Tables in job index order.
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.jobs.iter().map(|job| job.output.clone()).collect()
    }

    /// Merge the Output Tables into a dataset in `db_dir`. Refused unless
    /// every job of the batch succeeded.
    pub fn aggregate(&self, db_dir: &Path, opts: MergeOptions) -> Result<MergedDataset> {
        if !self.all_succeeded() {
            let failed = self
                .jobs
                .iter()
                .filter(|job| job.status != JobStatus::Succeeded)
                .map(|job| job.sample.display().to_string())
                .collect();
            return Err(AggregationError::IncompleteBatch {
                failed,
                total: self.jobs.len(),
            }
            .into());
        }
        merge_tables(&self.outputs(), db_dir, opts)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| path.display().to_string())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("unable to write {}", path.display()))
    }

    pub fn log_summary(&self) {
        let failed = self.failed();
        for job in &failed {
            match &job.status {
                JobStatus::Failed {
                    stage,
                    exit_code,
                    error,
                } => warn!(
                    "job {} ({}) failed at {} with exit code {}: {error}",
                    job.index,
                    job.sample.display(),
                    stage.map_or("input", Stage::name),
                    exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
                ),
                JobStatus::Rejected { error } => {
                    warn!("job {} ({}) was rejected: {error}", job.index, job.sample.display())
                }
                _ => {}
            }
        }
        info!(
            "batch {}: {} jobs, {} failed",
            self.job_group,
            self.jobs.len(),
            failed.len()
        );
    }
}

/// Job outcomes of a run, and the error that stopped it early.
enum BatchRun {
    Complete(Vec<JobOutcome>),
    Aborted(Vec<JobOutcome>, anyhow::Error),
}

pub struct Dispatcher {
    settings: BatchSettings,
    queue_args: QueueArgs,
    executable: PathBuf,
}

impl Dispatcher {
    /// `executable` is the `mainiac` binary that queued jobs run.
    pub fn new(settings: BatchSettings, queue_args: QueueArgs, executable: PathBuf) -> Result<Self> {
        let mut settings = settings;
        // Jobs may run with a different working directory.
        settings.input = std::path::absolute(&settings.input)
            .with_context(|| settings.input.display().to_string())?;
        settings.output_dir = std::path::absolute(&settings.output_dir)
            .with_context(|| settings.output_dir.display().to_string())?;
        settings.tools_json = settings
            .tools_json
            .map(|path| {
                std::path::absolute(&path).with_context(|| path.display().to_string())
            })
            .transpose()?;
        Ok(Dispatcher {
            settings,
            queue_args,
            executable,
        })
    }

    /// One job per discovered sample. Two samples may not share an Output
    /// Table, e.g. `s1.tsv` and `s1.txt` matched by the same pattern.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let settings = &self.settings;
        let jobs: Vec<Job> = discover_samples(&settings.input, &settings.pattern)?
            .into_iter()
            .enumerate()
            .map(|(index, path)| {
                let sample = Sample::new(path, settings.separator, &settings.seq_col);
                Job::new(index, sample, &settings.output_dir)
            })
            .collect();

        let mut owners: HashMap<&Path, &Job> = HashMap::new();
        for job in &jobs {
            if let Some(first) = owners.insert(&job.output, job) {
                bail!(
                    "{} and {} would both write {}",
                    first.sample.source.display(),
                    job.sample.source.display(),
                    job.output.display()
                );
            }
        }
        Ok(jobs)
    }

    pub fn run(&self, queue: &dyn JobQueue, pipeline: &Pipeline) -> Result<BatchReport> {
        let jobs = self.jobs()?;
        let job_group = self.queue_args.job_group();
        info!("batch {job_group}: {} samples", jobs.len());

        let outcomes = if self.queue_args.echo {
            BatchRun::Complete(self.preview(&jobs, &job_group, queue, pipeline))
        } else {
            fs::create_dir_all(&self.settings.output_dir)
                .with_context(|| self.settings.output_dir.display().to_string())?;
            if self.queue_args.no_lsf {
                BatchRun::Complete(self.run_local(&jobs, pipeline))
            } else {
                self.run_queued(&jobs, &job_group, queue, pipeline)
            }
        };

        let (outcomes, queue_error) = match outcomes {
            BatchRun::Complete(outcomes) => (outcomes, None),
            BatchRun::Aborted(outcomes, err) => (outcomes, Some(err)),
        };
        let report = BatchReport {
            job_group,
            jobs: outcomes,
        };
        if !self.queue_args.echo {
            report.write_json(&self.settings.output_dir.join(REPORT_FILE))?;
        }
        report.log_summary();
        match queue_error {
            Some(err) => Err(err.context(format!(
                "batch {} aborted, see {}",
                report.job_group,
                self.settings.output_dir.join(REPORT_FILE).display()
            ))),
            None => Ok(report),
        }
    }

    fn submission(&self, job: &Job, job_group: &str, pipeline: &Pipeline) -> QueueSubmission {
        QueueSubmission {
            job_name: format!("{job_group}_{}", job.index),
            queue: self.queue_args.queue.clone(),
            log_path: job.log.clone(),
            command: job.command(
                &self.executable,
                pipeline.args(),
                self.settings.tools_json.as_deref(),
            ),
        }
    }

    fn preview(
        &self,
        jobs: &[Job],
        job_group: &str,
        queue: &dyn JobQueue,
        pipeline: &Pipeline,
    ) -> Vec<JobOutcome> {
        jobs.iter()
            .map(|job| {
                let submission = self.submission(job, job_group, pipeline);
                let command = if self.queue_args.no_lsf {
                    shell_join(&submission.command)
                } else {
                    queue.describe(&submission)
                };
                println!("Would submit job: {command}");
                JobOutcome::new(job, JobStatus::Previewed { command })
            })
            .collect()
    }

    fn run_local(&self, jobs: &[Job], pipeline: &Pipeline) -> Vec<JobOutcome> {
        jobs.iter()
            .map(|job| {
                info!(
                    "job {} of {}: {}",
                    job.index + 1,
                    jobs.len(),
                    job.sample.source.display()
                );
                let status = match pipeline.run_sample(&job.sample, &job.output) {
                    Ok(outcome) => {
                        if let Some(err) = outcome.alignment_error {
                            warn!("job {}: {err}", job.index);
                        }
                        JobStatus::Succeeded
                    }
                    Err(err) => {
                        let stage = err.stage();
                        let exit_code = err.exit_status().and_then(|status| status.code());
                        let error = format!("{:#}", anyhow::Error::from(err));
                        warn!("job {} failed: {error}", job.index);
                        JobStatus::Failed {
                            stage,
                            exit_code,
                            error,
                        }
                    }
                };
                JobOutcome::new(job, status)
            })
            .collect()
    }

    /// If the queue cannot be polled, the jobs not yet submitted are
    /// recorded as rejected and the submitted ones stay `Submitted`.
    fn run_queued(
        &self,
        jobs: &[Job],
        job_group: &str,
        queue: &dyn JobQueue,
        pipeline: &Pipeline,
    ) -> BatchRun {
        let mut outcomes = Vec::with_capacity(jobs.len());
        let abort = |mut outcomes: Vec<JobOutcome>, err: anyhow::Error| {
            let error = format!("not submitted: {err:#}");
            for job in &jobs[outcomes.len()..] {
                outcomes.push(JobOutcome::new(
                    job,
                    JobStatus::Rejected {
                        error: error.clone(),
                    },
                ));
            }
            BatchRun::Aborted(outcomes, err)
        };

        for job in jobs {
            // The outcome is read from the presence of the Output Table.
            if job.output.exists() {
                debug!("removing stale {}", job.output.display());
                if let Err(err) = fs::remove_file(&job.output) {
                    return abort(
                        outcomes,
                        anyhow::Error::from(err).context(job.output.display().to_string()),
                    );
                }
            }
            let submission = self.submission(job, job_group, pipeline);
            debug!("{}", queue.describe(&submission));
            let status = match queue.submit(&submission) {
                Ok(()) => {
                    info!("submitted {}", submission.job_name);
                    JobStatus::Submitted
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!("{error}");
                    JobStatus::Rejected { error }
                }
            };
            outcomes.push(JobOutcome::new(job, status));
            if let Err(err) = self.wait_for_queue(queue, job_group, self.queue_args.max_jobs) {
                return abort(outcomes, err);
            }
        }

        info!("all jobs submitted, waiting for {job_group} to finish");
        if let Err(err) = self.wait_for_queue(queue, job_group, 0) {
            return abort(outcomes, err);
        }

        for (outcome, job) in outcomes.iter_mut().zip(jobs) {
            if outcome.status != JobStatus::Submitted {
                continue;
            }
            outcome.status = if job.output.exists() {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed {
                    stage: None,
                    exit_code: None,
                    error: format!("no Output Table written, see {}", job.log.display()),
                }
            };
        }
        BatchRun::Complete(outcomes)
    }

    /// Block until at most `limit` jobs of the group are unfinished.
    fn wait_for_queue(&self, queue: &dyn JobQueue, job_group: &str, limit: usize) -> Result<()> {
        loop {
            let count = queue
                .count(job_group, &self.queue_args.queue)
                .with_context(|| format!("unable to count the jobs of {job_group}"))?;
            if count <= limit {
                return Ok(());
            }
            debug!("{count} jobs of {job_group} unfinished, waiting for {limit}");
            thread::sleep(self.queue_args.poll_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_tools, pipeline_args, tool_calls, workspaces_in, write_table};
    use mainiac_aggr::merge::MERGED_FILE;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// Pretends every job stays unfinished for a few polls, and runs nothing.
    /// Jobs named in `fail` never write their Output Table.
    #[derive(Default)]
    struct FakeQueue {
        reject: Vec<usize>,
        fail: Vec<usize>,
        max_jobs: usize,
        /// Every poll of the queue fails, as if bjobs could not be started.
        unreachable: bool,
        state: RefCell<FakeQueueState>,
    }

    #[derive(Default)]
    struct FakeQueueState {
        /// Job name and polls left before it finishes.
        unfinished: Vec<(String, usize)>,
        submitted: Vec<String>,
        last_count: Option<usize>,
        max_count: usize,
        admission_violations: usize,
    }

    const POLLS_PER_JOB: usize = 3;

    fn output_file(command: &[OsString]) -> PathBuf {
        let pos = command.iter().position(|a| a == "--output-file").unwrap();
        PathBuf::from(&command[pos + 1])
    }

    impl JobQueue for FakeQueue {
        fn submit(&self, submission: &QueueSubmission) -> Result<()> {
            let mut state = self.state.borrow_mut();
            if state.last_count.is_some_and(|c| c > self.max_jobs) {
                state.admission_violations += 1;
            }
            let index: usize = submission.job_name.rsplit('_').next().unwrap().parse()?;
            if self.reject.contains(&index) {
                bail!("queue closed");
            }
            if !self.fail.contains(&index) {
                fs::write(output_file(&submission.command), "Id,1\nq0,E\n")?;
            }
            state.submitted.push(submission.job_name.clone());
            state
                .unfinished
                .push((submission.job_name.clone(), POLLS_PER_JOB));
            Ok(())
        }

        fn count(&self, group: &str, queue: &str) -> Result<usize> {
            assert_eq!(queue, "test-queue");
            if self.unreachable {
                bail!("bjobs: No such file or directory");
            }
            let mut state = self.state.borrow_mut();
            let count = state
                .unfinished
                .iter()
                .filter(|(name, _)| name.starts_with(&format!("{group}_")))
                .count();
            for (_, polls) in &mut state.unfinished {
                *polls -= 1;
            }
            state.unfinished.retain(|(_, polls)| *polls > 0);
            state.last_count = Some(count);
            state.max_count = state.max_count.max(count);
            Ok(count)
        }

        fn describe(&self, submission: &QueueSubmission) -> String {
            format!("fake-submit {}", shell_join(&submission.command))
        }
    }

    fn queue_args(max_jobs: usize) -> QueueArgs {
        QueueArgs {
            max_jobs,
            queue: "test-queue".to_string(),
            job_name: Some("test_batch".to_string()),
            poll_interval: 0,
            ..Default::default()
        }
    }

    fn settings(input: &Path, output_dir: &Path) -> BatchSettings {
        BatchSettings {
            input: input.to_path_buf(),
            pattern: DEFAULT_PATTERN.to_string(),
            output_dir: output_dir.to_path_buf(),
            seq_col: "sequence_aa".to_string(),
            separator: Separator::TAB,
            tools_json: None,
        }
    }

    /// Three samples a, b and c in `dir/input`, plus a file the pattern skips.
    fn write_inputs(dir: &Path) -> PathBuf {
        let input = dir.join("input");
        fs::create_dir(&input).unwrap();
        write_table(&input.join("c.tsv"), &["EVQLV", "QVQLQ"]);
        write_table(&input.join("a.tsv"), &["EVQLV"]);
        write_table(&input.join("b.tsv"), &["DIQMT", "", "QVQLV"]);
        fs::write(input.join("notes.txt"), "not a sample").unwrap();
        input
    }

    #[test]
    fn test_discover_samples() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let names: Vec<_> = discover_samples(&input, DEFAULT_PATTERN)?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.tsv", "b.tsv", "c.tsv"]);

        let single = input.join("b.tsv");
        assert_eq!(discover_samples(&single, DEFAULT_PATTERN)?, vec![single]);
        assert!(discover_samples(&input, "*.csv").is_err());
        assert!(discover_samples(&dir.path().join("missing"), DEFAULT_PATTERN).is_err());
        Ok(())
    }

    #[test]
    fn test_job_command() -> Result<()> {
        let dir = tempdir()?;
        let args = PipelineArgs {
            keep_align: true,
            ..pipeline_args(dir.path())
        };
        let job = Job::new(
            2,
            Sample::new("/data/s1.tsv", Separator::TAB, "sequence_aa"),
            Path::new("/results"),
        );
        assert_eq!(job.output, Path::new("/results/s1.out.csv"));
        assert_eq!(job.log, Path::new("/results/job_2.out"));

        let command = job.command(Path::new("/opt/mainiac"), &args, Some(Path::new("/etc/tools.json")));
        let expected: Vec<OsString> = [
            "/opt/mainiac",
            "run",
            "--source-file",
            "/data/s1.tsv",
            "--seq-col-name",
            "sequence_aa",
            "--sep",
            "\\t",
            "--ref-v",
            args.ref_v.to_str().unwrap(),
            "--ref-j",
            args.ref_j.to_str().unwrap(),
            "--output-file",
            "/results/s1.out.csv",
            "--keep-align",
            "--tools-json",
            "/etc/tools.json",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        assert_eq!(command, expected);
        Ok(())
    }

    #[test]
    fn test_local_batch() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            settings(&input, &output_dir),
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;
        let report = dispatcher.run(&FakeQueue::default(), &pipeline)?;

        assert!(report.all_succeeded());
        for name in ["a", "b", "c"] {
            assert!(output_dir.join(format!("{name}.out.csv")).exists());
        }
        assert_eq!(
            fs::read_to_string(output_dir.join("b.out.csv"))?,
            "Id,1,2,3,4\nq0,E,V,W,G\nq1,E,V,W,G\n"
        );
        assert!(workspaces_in(&output_dir).is_empty());
        assert!(output_dir.join(REPORT_FILE).exists());

        // Every job ran its four tools before the next one started.
        let calls = tool_calls(&output_dir);
        assert_eq!(calls.len(), 12);
        for job in calls.chunks(4) {
            let workspace = job[0].split_once(' ').unwrap().1;
            assert_eq!(job[3], format!("done {workspace}"));
            assert!(job.iter().all(|line| line.ends_with(workspace)));
        }
        Ok(())
    }

    #[test]
    fn test_failed_sample_does_not_stop_batch() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        fs::write(input.join("b.tsv"), "cell\tjunction_aa\nx\tCARW\n")?;
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            settings(&input, &output_dir),
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;
        let report = dispatcher.run(&FakeQueue::default(), &pipeline)?;

        let statuses: Vec<_> = report.jobs.iter().map(|j| j.is_failure()).collect();
        assert_eq!(statuses, [false, true, false]);
        let JobStatus::Failed { stage, error, .. } = &report.jobs[1].status else {
            panic!("expected job 1 to fail");
        };
        assert_eq!(*stage, None);
        assert!(error.contains("sequence_aa"), "{error}");
        assert!(!output_dir.join("b.out.csv").exists());
        assert!(output_dir.join("c.out.csv").exists());
        Ok(())
    }

    #[test]
    fn test_stage_failure_recorded() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let output_dir = dir.path().join("output");
        let args = PipelineArgs {
            ref_j: dir.path().join("missing_ref_j.fa"),
            ..pipeline_args(dir.path())
        };
        let pipeline = Pipeline::new(fake_tools(), args)?;
        let dispatcher = Dispatcher::new(
            settings(&input.join("a.tsv"), &output_dir),
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;
        let report = dispatcher.run(&FakeQueue::default(), &pipeline)?;
        assert!(matches!(
            report.jobs[0].status,
            JobStatus::Failed {
                stage: Some(Stage::JSplit),
                exit_code: Some(1),
                ..
            }
        ));
        assert_eq!(workspaces_in(&output_dir).len(), 1);

        let json: serde_json::Value =
            serde_json::from_reader(File::open(output_dir.join(REPORT_FILE))?)?;
        assert_eq!(json["job_group"], "test_batch");
        assert_eq!(json["jobs"][0]["status"], "failed");
        assert_eq!(json["jobs"][0]["stage"], "j_split");
        Ok(())
    }

    #[test]
    fn test_queue_admission_and_drain() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("input");
        fs::create_dir(&input)?;
        for i in 0..6 {
            write_table(&input.join(format!("s{i}.tsv")), &["EVQLV"]);
        }
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher =
            Dispatcher::new(settings(&input, &output_dir), queue_args(2), "mainiac".into())?;
        let queue = FakeQueue {
            reject: vec![1],
            fail: vec![4],
            max_jobs: 2,
            ..Default::default()
        };
        let report = dispatcher.run(&queue, &pipeline)?;

        let state = queue.state.borrow();
        assert_eq!(state.admission_violations, 0);
        assert!(state.max_count <= 3, "cap overshot by more than one job");
        assert!(state.unfinished.is_empty());
        assert_eq!(
            state.submitted,
            ["test_batch_0", "test_batch_2", "test_batch_3", "test_batch_4", "test_batch_5"]
        );

        let statuses: Vec<_> = report.jobs.iter().map(|j| &j.status).collect();
        assert_eq!(statuses[0], &JobStatus::Succeeded);
        assert!(matches!(statuses[1], JobStatus::Rejected { .. }));
        assert!(matches!(statuses[4], JobStatus::Failed { stage: None, .. }));
        assert_eq!(report.failed().len(), 2);
        assert_eq!(report.outputs()[5], output_dir.join("s5.out.csv"));
        Ok(())
    }

    #[test]
    fn test_colliding_outputs_rejected() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("input");
        fs::create_dir(&input)?;
        write_table(&input.join("s1.tsv"), &["EVQLV"]);
        write_table(&input.join("s1.txt"), &["DIQMT"]);
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            BatchSettings {
                pattern: "s1.*".to_string(),
                ..settings(&input, &output_dir)
            },
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;

        let err = dispatcher.run(&FakeQueue::default(), &pipeline).unwrap_err();
        assert!(err.to_string().contains("s1.out.csv"), "{err}");
        assert!(!output_dir.exists());
        Ok(())
    }

    #[test]
    fn test_aggregate_local_batch() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            settings(&input, &output_dir),
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;
        let report = dispatcher.run(&FakeQueue::default(), &pipeline)?;

        let db = dir.path().join("db");
        let dataset = report.aggregate(&db, MergeOptions::default())?;
        let ids: Vec<_> = dataset.rows.iter().map(|r| r.sequence_id.as_str()).collect();
        assert_eq!(ids, ["0-0", "1-0", "1-1", "2-0", "2-1"]);
        assert_eq!(dataset.rows[1].sample, "b");
        assert!(db.join(MERGED_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_aggregate_refuses_failed_batch() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        fs::write(input.join("b.tsv"), "cell\tjunction_aa\nx\tCARW\n")?;
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            settings(&input, &output_dir),
            QueueArgs {
                no_lsf: true,
                ..queue_args(1)
            },
            "mainiac".into(),
        )?;
        let report = dispatcher.run(&FakeQueue::default(), &pipeline)?;

        let db = dir.path().join("db");
        let err = report.aggregate(&db, MergeOptions::default()).unwrap_err();
        match err.downcast_ref::<AggregationError>() {
            Some(AggregationError::IncompleteBatch { failed, total }) => {
                assert_eq!(*total, 3);
                assert_eq!(failed.len(), 1);
                assert!(failed[0].ends_with("b.tsv"), "{failed:?}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!db.join(MERGED_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_queue_poll_failure_writes_report() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher =
            Dispatcher::new(settings(&input, &output_dir), queue_args(2), "mainiac".into())?;
        let queue = FakeQueue {
            unreachable: true,
            ..Default::default()
        };

        let err = dispatcher.run(&queue, &pipeline).unwrap_err();
        assert!(format!("{err:#}").contains("bjobs"), "{err:#}");
        assert_eq!(queue.state.borrow().submitted, ["test_batch_0"]);

        let json: serde_json::Value =
            serde_json::from_reader(File::open(output_dir.join(REPORT_FILE))?)?;
        let statuses: Vec<_> = json["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|job| job["status"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(statuses, ["submitted", "rejected", "rejected"]);
        Ok(())
    }

    #[test]
    fn test_preview_runs_nothing() -> Result<()> {
        let dir = tempdir()?;
        let input = write_inputs(dir.path());
        let output_dir = dir.path().join("output");
        let pipeline = Pipeline::new(fake_tools(), pipeline_args(dir.path()))?;
        let dispatcher = Dispatcher::new(
            settings(&input, &output_dir),
            QueueArgs {
                echo: true,
                ..queue_args(1)
            },
            "/opt/mainiac".into(),
        )?;
        let queue = FakeQueue::default();
        let report = dispatcher.run(&queue, &pipeline)?;

        assert!(!output_dir.exists());
        assert!(queue.state.borrow().submitted.is_empty());
        let JobStatus::Previewed { command } = &report.jobs[0].status else {
            panic!("expected a preview");
        };
        assert!(command.starts_with("fake-submit /opt/mainiac run --source-file "));
        assert!(command.contains("a.tsv"));
        Ok(())
    }
}
