//! mainiac
#![deny(missing_docs)]

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use mainiac_aggr::MergeOptions;
use mainiac_wrap::dispatch::{BatchSettings, Dispatcher, DEFAULT_PATTERN};
use mainiac_wrap::env::ToolEnv;
use mainiac_wrap::pipeline::{Pipeline, PipelineArgs};
use mainiac_wrap::queue::LsfQueue;
use mainiac_wrap::queue_args::QueueArgs;
use mainiac_wrap::sample::{Sample, Separator};
use mainiac_wrap::utils::{print_error_chain, CliPath};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

const CMD: &str = "mainiac";

/// Number immune-receptor amino-acid sequences with MAFFT and the MAINIAC
/// post-processors
#[derive(Parser, Debug)]
#[clap(name = CMD, version, before_help = format!("{CMD} {}", env!("CARGO_PKG_VERSION")))]
struct Mainiac {
    #[clap(subcommand)]
    subcmd: SubCommand,

    /// JSON file with the paths of mafft, MafftGapConverter and concatenate,
    /// e.g. {"mafft": "/opt/mafft/bin/mafft"}. Every key is optional.
    #[clap(long, global = true, value_name = "PATH")]
    tools_json: Option<CliPath>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Number the sequences of one input table.
    #[clap(name = "run")]
    Run(Run),

    /// Number every input table of a directory, on LSF or in this process,
    /// and optionally merge the results into one dataset.
    #[clap(name = "batch")]
    Batch(Batch),
}

/// Options shared by `run` and `batch`.
#[derive(Parser, Debug, Clone)]
struct PipelineFlags {
    /// Field separator of the input tables: a single character, \t or tab.
    #[clap(long, value_name = "SEP", default_value = "\\t")]
    sep: Separator,

    /// Reference alignment of the V genes.
    #[clap(long, value_name = "FASTA")]
    ref_v: PathBuf,

    /// Reference alignment of the J genes.
    #[clap(long, value_name = "FASTA")]
    ref_j: PathBuf,

    /// Keep the scratch directory of a successful run.
    #[clap(long)]
    keep_temp: bool,

    /// Keep the alignments and numbered tables in <OUTPUT_STEM>_alignment
    /// next to the Output Table.
    #[clap(long)]
    keep_align: bool,

    /// Create scratch directories here instead of next to the Output Table.
    #[clap(long, value_name = "PATH")]
    temp_dir: Option<CliPath>,
}

impl PipelineFlags {
    fn to_args(&self) -> PipelineArgs {
        PipelineArgs {
            ref_v: self.ref_v.clone(),
            ref_j: self.ref_j.clone(),
            keep_temp: self.keep_temp,
            keep_align: self.keep_align,
            temp_root: self.temp_dir.clone().map(PathBuf::from),
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct Run {
    /// Input table holding the sequences.
    #[clap(long, value_name = "PATH")]
    source_file: PathBuf,

    /// Name of the column holding the amino-acid sequences.
    #[clap(long, value_name = "NAME")]
    seq_col_name: String,

    #[clap(flatten)]
    pipeline: PipelineFlags,

    /// Output Table to write.
    #[clap(long, value_name = "PATH")]
    output_file: PathBuf,
}

#[derive(Parser, Debug, Clone)]
struct Batch {
    /// Input table, or a directory of input tables.
    #[clap(short = 'i', long = "input", value_name = "PATH")]
    input: CliPath,

    /// Directory receiving the Output Tables, job logs and batch report.
    #[clap(short = 'o', long = "output", value_name = "PATH")]
    output_dir: PathBuf,

    /// Name of the column holding the amino-acid sequences.
    #[clap(long, value_name = "NAME", default_value = "sequence_aa")]
    seq_col_name: String,

    /// Glob selecting the input tables of a directory.
    #[clap(long, value_name = "GLOB", default_value = DEFAULT_PATTERN)]
    pattern: String,

    #[clap(flatten)]
    pipeline: PipelineFlags,

    #[clap(flatten)]
    queue: QueueArgs,

    #[clap(flatten)]
    db: DbArgs,
}

#[derive(Parser, Debug, Clone)]
struct DbArgs {
    /// Merge the Output Tables into a dataset in this directory once every
    /// job has finished.
    #[clap(long, value_name = "DIR")]
    db: Option<PathBuf>,

    /// Collapse identical numbered sequences of a sample into one entry.
    #[clap(long, requires = "db")]
    clonotype: bool,

    /// Order the rows of merged.tsv by the number of residues.
    #[clap(long, requires = "db")]
    sort_by_length: bool,

    /// Also write the dataset as merged.tsv.
    #[clap(long, requires = "db")]
    tsv: bool,
}

impl DbArgs {
    fn options(&self) -> MergeOptions {
        MergeOptions {
            clonotype: self.clonotype,
            sort_by_length: self.sort_by_length,
            write_tsv: self.tsv,
        }
    }
}

// Set COLUMNS to 80 when the terminal size is unknown.
// Wrap the output of --help to 80 columns when the terminal size is unknown.
// The default value of clap is 100.
fn set_env_columns() {
    if terminal_size::terminal_size().is_none() && std::env::var_os("COLUMNS").is_none() {
        std::env::set_var("COLUMNS", "80");
    }
}

fn init_logging() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn run_batch(b: Batch, tools: ToolEnv, tools_json: Option<PathBuf>) -> Result<ExitCode> {
    let pipeline = Pipeline::new(tools, b.pipeline.to_args())?;
    let settings = BatchSettings {
        input: b.input.into(),
        pattern: b.pattern,
        output_dir: b.output_dir,
        seq_col: b.seq_col_name,
        separator: b.pipeline.sep,
        tools_json,
    };
    info!("queue options: {}", b.queue.get_args().join(" "));
    let executable =
        std::env::current_exe().context("unable to locate the mainiac executable")?;
    let dispatcher = Dispatcher::new(settings, b.queue.clone(), executable)?;
    let report = dispatcher.run(&LsfQueue::default(), &pipeline)?;

    let Some(db) = &b.db.db else {
        return Ok(ExitCode::SUCCESS);
    };
    if b.queue.echo {
        info!("preview only, not merging into {}", db.display());
        return Ok(ExitCode::SUCCESS);
    }
    report.aggregate(db, b.db.options())?;
    Ok(ExitCode::SUCCESS)
}

fn inner_main() -> Result<ExitCode> {
    set_env_columns();
    let opts = Mainiac::parse();
    init_logging();

    let tools = ToolEnv::setup(opts.tools_json.as_deref())?;
    match opts.subcmd {
        SubCommand::Run(r) => {
            let pipeline = Pipeline::new(tools, r.pipeline.to_args())?;
            let sample = Sample::new(r.source_file, r.pipeline.sep, &r.seq_col_name);
            pipeline.run_sample(&sample, &r.output_file)?;
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::Batch(b) => run_batch(b, tools, opts.tools_json.map(PathBuf::from)),
    }
}

fn main() -> ExitCode {
    match inner_main() {
        Ok(exit_code) => exit_code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
