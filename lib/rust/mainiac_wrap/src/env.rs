//! Locations of the external tools.
//!
//! Each tool is looked up in the `--tools-json` override file first, then in
//! the environment, and finally falls back to a default: `mafft` from `PATH`
//! and the post-processors next to the running executable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub const MAFFT_VAR: &str = "MAINIAC_MAFFT";
pub const CONVERTER_VAR: &str = "MAINIAC_CONVERTER";
pub const CONCATENATE_VAR: &str = "MAINIAC_CONCATENATE";
/// Directory holding both post-processors.
pub const BIN_DIR_VAR: &str = "MAINIAC_BIN_DIR";

const MAFFT_NAME: &str = "mafft";
const CONVERTER_NAME: &str = "MafftGapConverter";
const CONCATENATE_NAME: &str = "concatenate";

/// Contents of the `--tools-json` file. Every key is optional.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ToolOverrides {
    mafft: Option<PathBuf>,
    converter: Option<PathBuf>,
    concatenate: Option<PathBuf>,
}

impl ToolOverrides {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid tool configuration {}", path.display()))
    }
}

/// Resolved paths of the programs the pipeline invokes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolEnv {
    pub mafft: PathBuf,
    pub converter: PathBuf,
    pub concatenate: PathBuf,
}

impl ToolEnv {
    /// Resolve the tool paths for this process.
    pub fn setup(override_json: Option<&Path>) -> Result<ToolEnv> {
        let overrides = match override_json {
            Some(path) => ToolOverrides::load(path)?,
            None => ToolOverrides::default(),
        };
        let exe = env::current_exe().context("unable to locate the running executable")?;
        let exe_dir = exe.parent().unwrap_or(Path::new(""));
        let tools = resolve(overrides, |key| env::var_os(key), exe_dir)?;
        log::debug!("{tools:?}");
        Ok(tools)
    }
}

fn resolve(
    overrides: ToolOverrides,
    lookup: impl Fn(&str) -> Option<OsString>,
    exe_dir: &Path,
) -> Result<ToolEnv> {
    let bin_dir = lookup(BIN_DIR_VAR).map_or_else(|| exe_dir.to_path_buf(), PathBuf::from);
    let pick = |configured: Option<PathBuf>, var: &str, default: PathBuf| {
        absolutize(
            configured
                .or_else(|| lookup(var).map(PathBuf::from))
                .unwrap_or(default),
        )
    };
    Ok(ToolEnv {
        mafft: pick(overrides.mafft, MAFFT_VAR, PathBuf::from(MAFFT_NAME))?,
        converter: pick(overrides.converter, CONVERTER_VAR, bin_dir.join(CONVERTER_NAME))?,
        concatenate: pick(
            overrides.concatenate,
            CONCATENATE_VAR,
            bin_dir.join(CONCATENATE_NAME),
        )?,
    })
}

/// Tools run inside the workspace, so a path with a directory component must
/// not stay relative. A bare program name is left for the `PATH` search.
fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.components().count() > 1 {
        std::path::absolute(&path).with_context(|| path.display().to_string())
    } else {
        Ok(path)
    }
}
