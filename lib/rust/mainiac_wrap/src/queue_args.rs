use crate::utils::validate_id;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_QUEUE: &str = "alma8-batch";

#[derive(Parser, Debug, Clone)]
pub struct QueueArgs {
    /// Run every job in this process, one after another, instead of
    /// submitting them to LSF.
    #[clap(long)]
    pub no_lsf: bool,

    /// Set max jobs of this batch pending or running on the queue at one
    /// time. Only applies to LSF.
    #[clap(long, value_name = "NUM", default_value_t = 100)]
    pub max_jobs: usize,

    /// LSF queue the jobs are submitted to.
    #[clap(
        long,
        value_name = "QUEUE",
        default_value = DEFAULT_QUEUE,
        value_parser = NonEmptyStringValueParser::new(),
    )]
    pub queue: String,

    /// Name shared by the jobs of this batch. Jobs are named
    /// <JOB_NAME>_<INDEX>. Defaults to a generated unique name.
    #[clap(long, value_name = "NAME", value_parser = validate_id)]
    pub job_name: Option<String>,

    /// Seconds to wait between two polls of the queue.
    #[clap(long, value_name = "SECS", default_value_t = 10)]
    pub poll_interval: u64,

    /// Print the command of every job instead of running it.
    #[clap(long)]
    pub echo: bool,
}

impl Default for QueueArgs {
    fn default() -> Self {
        QueueArgs {
            no_lsf: false,
            max_jobs: 100,
            queue: DEFAULT_QUEUE.to_string(),
            job_name: None,
            poll_interval: 10,
            echo: false,
        }
    }
}

impl QueueArgs {
    /// The job group of this batch: `--job-name` or a fresh
    /// `mainiac_<8 hex digits>`, so that two batches never count each
    /// other's jobs.
    pub fn job_group(&self) -> String {
        match &self.job_name {
            Some(name) => name.clone(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("mainiac_{}", &id[..8])
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Convert this struct back into command line arguments.
    pub fn get_args(&self) -> Vec<String> {
        [
            self.no_lsf.then_some("--no-lsf".to_string()),
            Some(format!("--max-jobs={}", self.max_jobs)),
            Some(format!("--queue={}", self.queue)),
            optional_arg(&self.job_name, "job-name"),
            Some(format!("--poll-interval={}", self.poll_interval)),
            self.echo.then_some("--echo".to_string()),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn optional_arg<T: std::fmt::Display>(arg: &Option<T>, param_name: &str) -> Option<String> {
    arg.as_ref().map(|x| format!("--{param_name}={x}"))
}
