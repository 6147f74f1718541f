//! The fixed per-sample numbering pipeline.
//!
//! The sequences are split into their V and J portions with a first
//! alignment against the J reference, each portion is aligned and numbered
//! separately, and the two numbered tables are joined into the Output Table.
//! All intermediate files live in a [`Workspace`] next to the Output Table.

use crate::env::ToolEnv;
use crate::sample::{write_fasta, Sample, SequenceRecord};
use crate::tool::{ToolCall, ToolError, ToolOutput};
use crate::workspace::Workspace;
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tempfile::NamedTempFile;

const QUERY_FASTA: &str = "query_sequences.fa";
const DELETE_FASTA: &str = "delete.fa";
const SPLIT_OUTPUT: &str = "query";
const V_FASTA: &str = "query_vSeqs.fa";
const J_FASTA: &str = "query_jSeqs.fa";
const V_ALIGNMENT: &str = "mafftoutV";
const J_ALIGNMENT: &str = "mafftoutJ";
const V_NUMBERED: &str = "v.number.csv";
const J_NUMBERED: &str = "j.number.csv";
const OUTPUT_TABLE: &str = "out.csv";

/// Stages run sequentially, so one aligner thread is enough.
const MAFFT_THREADS: &str = "1";

/// Mode argument that makes the converter split off the J portion.
const J_SPLIT_MODE: &str = "j";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EmitFasta,
    JSplit,
    VNumbering,
    JNumbering,
    Concatenate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::EmitFasta,
        Stage::JSplit,
        Stage::VNumbering,
        Stage::JNumbering,
        Stage::Concatenate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::EmitFasta => "emit_fasta",
            Stage::JSplit => "j_split",
            Stage::VNumbering => "v_numbering",
            Stage::JNumbering => "j_numbering",
            Stage::Concatenate => "concatenate",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(anyhow::Error),

    #[error("unable to create a workspace in {parent:?}")]
    Workspace {
        parent: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{stage} failed, intermediate files kept in {workspace:?}")]
    Stage {
        stage: Stage,
        workspace: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// The stage that failed, if any stage ran.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Exit status of the external tool that failed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            PipelineError::Stage { source, .. } => source
                .downcast_ref::<ToolError>()
                .and_then(ToolError::exit_status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineArgs {
    pub ref_v: PathBuf,
    pub ref_j: PathBuf,
    /// Leave the workspace on disk after a successful run.
    pub keep_temp: bool,
    /// Copy the intermediate files to `<output_stem>_alignment/`.
    pub keep_align: bool,
    /// Create workspaces here instead of next to the Output Table.
    pub temp_root: Option<PathBuf>,
}

/// What a successful run left on disk.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub output: PathBuf,
    pub sequences: usize,
    pub alignment_dir: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    /// Set when the intermediate files could not be copied for
    /// `keep_align`. The workspace is then retained in their place.
    pub alignment_error: Option<String>,
}

pub struct Pipeline {
    tools: ToolEnv,
    args: PipelineArgs,
}

impl Pipeline {
    pub fn new(tools: ToolEnv, mut args: PipelineArgs) -> anyhow::Result<Pipeline> {
        // The tools run inside the workspace.
        args.ref_v = std::path::absolute(&args.ref_v)
            .with_context(|| format!("invalid V reference {:?}", args.ref_v))?;
        args.ref_j = std::path::absolute(&args.ref_j)
            .with_context(|| format!("invalid J reference {:?}", args.ref_j))?;
        Ok(Pipeline { tools, args })
    }

    pub fn tools(&self) -> &ToolEnv {
        &self.tools
    }

    pub fn args(&self) -> &PipelineArgs {
        &self.args
    }

    /// Read the sequences of `sample` and number them into `output`.
    pub fn run_sample(
        &self,
        sample: &Sample,
        output: &Path,
    ) -> Result<PipelineOutcome, PipelineError> {
        let records = sample.read_sequences().map_err(PipelineError::Input)?;
        info!(
            "{}: read {} sequences from column {:?}",
            sample.name(),
            records.len(),
            sample.seq_col
        );
        self.run(&records, output)
    }

    /// Number `records` and write the Output Table to `output`.
    ///
    /// On failure the workspace is kept for inspection and its path is part
    /// of the error.
    pub fn run(
        &self,
        records: &[SequenceRecord],
        output: &Path,
    ) -> Result<PipelineOutcome, PipelineError> {
        if records.is_empty() {
            return Err(PipelineError::Input(anyhow!(
                "no sequences to number for {}",
                output.display()
            )));
        }
        let output = std::path::absolute(output)
            .with_context(|| format!("invalid output path {output:?}"))
            .map_err(PipelineError::Input)?;
        let output_dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("unable to create {}", output_dir.display()))
            .map_err(PipelineError::Input)?;
        let parent = self.args.temp_root.clone().unwrap_or(output_dir);
        let workspace = Workspace::create_in(&parent)
            .map_err(|source| PipelineError::Workspace { parent, source })?;
        debug!("workspace {}", workspace.path().display());

        if let Err((stage, source)) = self.run_stages(records, workspace.path(), &output) {
            let workspace = workspace.retain();
            warn!(
                "{stage} failed for {}, intermediate files kept in {}",
                output.display(),
                workspace.display()
            );
            return Err(PipelineError::Stage {
                stage,
                workspace,
                source,
            });
        }

        let mut alignment_error = None;
        let alignment_dir = if self.args.keep_align {
            let dir = alignment_dir(&output);
            match workspace.copy_contents(&dir) {
                Ok(_) => Some(dir),
                Err(err) => {
                    alignment_error = Some(format!(
                        "unable to copy intermediate files to {}: {err}",
                        dir.display()
                    ));
                    None
                }
            }
        } else {
            None
        };
        let workspace = if self.args.keep_temp || alignment_error.is_some() {
            Some(workspace.retain())
        } else {
            if let Err(err) = workspace.close() {
                warn!("unable to remove workspace: {err}");
            }
            None
        };

        if let (Some(err), Some(workspace)) = (&alignment_error, &workspace) {
            warn!("{err}, intermediate files kept in {}", workspace.display());
        }

        info!("wrote {} rows to {}", records.len(), output.display());
        Ok(PipelineOutcome {
            output,
            sequences: records.len(),
            alignment_dir,
            workspace,
            alignment_error,
        })
    }

    fn run_stages(
        &self,
        records: &[SequenceRecord],
        dir: &Path,
        output: &Path,
    ) -> Result<(), (Stage, anyhow::Error)> {
        for stage in Stage::ALL {
            debug!("starting {stage}");
            let result = match stage {
                Stage::EmitFasta => emit_fasta(records, dir),
                Stage::JSplit => self.split_j(dir),
                Stage::VNumbering => {
                    self.number(dir, &self.args.ref_v, V_FASTA, V_ALIGNMENT, V_NUMBERED)
                }
                Stage::JNumbering => {
                    self.number(dir, &self.args.ref_j, J_FASTA, J_ALIGNMENT, J_NUMBERED)
                }
                Stage::Concatenate => self.concatenate(dir, output),
            };
            result.map_err(|err| (stage, err))?;
        }
        Ok(())
    }

    /// Add `fragments` to the alignment of `reference`, writing `{fragments}.map`.
    fn mafft(&self, fragments: &str, reference: &Path) -> ToolCall {
        ToolCall::new(&self.tools.mafft)
            .args([
                "--addfragments",
                fragments,
                "--compactmapout",
                "--thread",
                MAFFT_THREADS,
            ])
            .arg(reference)
            .produces(map_file(fragments))
    }

    fn split_j(&self, dir: &Path) -> anyhow::Result<()> {
        self.mafft(QUERY_FASTA, &self.args.ref_j)
            .stdout(ToolOutput::Discard)
            .invoke(dir)?;
        ToolCall::new(&self.tools.converter)
            .args([
                QUERY_FASTA,
                map_file(QUERY_FASTA).as_str(),
                DELETE_FASTA,
                SPLIT_OUTPUT,
                J_SPLIT_MODE,
            ])
            .produces(SPLIT_OUTPUT)
            .produces(J_FASTA)
            .invoke(dir)?;
        fs::rename(dir.join(SPLIT_OUTPUT), dir.join(V_FASTA))
            .with_context(|| format!("unable to rename {SPLIT_OUTPUT} to {V_FASTA}"))?;
        match fs::remove_file(dir.join(DELETE_FASTA)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("unable to remove {DELETE_FASTA}"))
            }
            _ => Ok(()),
        }
    }

    fn number(
        &self,
        dir: &Path,
        reference: &Path,
        fasta: &str,
        alignment: &str,
        numbered: &str,
    ) -> anyhow::Result<()> {
        self.mafft(fasta, reference)
            .stdout(ToolOutput::File(alignment.into()))
            .invoke(dir)?;
        ToolCall::new(&self.tools.converter)
            .args([fasta, map_file(fasta).as_str(), alignment, numbered])
            .produces(numbered)
            .invoke(dir)?;
        Ok(())
    }

    fn concatenate(&self, dir: &Path, output: &Path) -> anyhow::Result<()> {
        ToolCall::new(&self.tools.concatenate)
            .args([V_NUMBERED, J_NUMBERED, OUTPUT_TABLE])
            .produces(OUTPUT_TABLE)
            .invoke(dir)?;
        move_into_place(&dir.join(OUTPUT_TABLE), output)
    }
}

fn map_file(fasta: &str) -> String {
    format!("{fasta}.map")
}

fn emit_fasta(records: &[SequenceRecord], dir: &Path) -> anyhow::Result<()> {
    let path = dir.join(QUERY_FASTA);
    let file = File::create(&path).with_context(|| path.display().to_string())?;
    write_fasta(records, BufWriter::new(file)).with_context(|| path.display().to_string())
}

/// `sample.out.csv` keeps its intermediate files in `sample.out_alignment/`.
fn alignment_dir(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{stem}_alignment"))
}

/// Replace `dest` with `src` atomically. A plain rename is tried first; across
/// filesystems the file is copied next to `dest` and renamed from there.
fn move_into_place(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    let parent = dest.parent().unwrap_or(Path::new("."));
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("unable to stage output in {}", parent.display()))?;
    let mut reader = File::open(src).with_context(|| src.display().to_string())?;
    io::copy(&mut reader, staged.as_file_mut())
        .with_context(|| format!("unable to copy {}", src.display()))?;
    staged
        .persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("unable to write {}", dest.display()))?;
    Ok(())
}
