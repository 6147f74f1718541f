//! Stand-ins for the external tools, written as small shell scripts that
//! follow the same command line contracts.

use crate::env::ToolEnv;
use crate::pipeline::PipelineArgs;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;

/// Every fake tool appends a line to this file in the parent of its working
/// directory, i.e. next to the Output Table.
pub(crate) const TOOL_LOG: &str = "tool_calls.log";

const FAKE_MAFFT: &str = r#"#!/bin/sh
frag="$2"
ref="$6"
[ -r "$ref" ] || { echo "cannot open $ref" >&2; exit 1; }
[ -r "$frag" ] || { echo "cannot open $frag" >&2; exit 1; }
echo "align $(pwd)" >> ../tool_calls.log
grep '^>' "$frag" > "$frag.map"
cat "$ref" "$frag"
"#;

const FAKE_CONVERTER: &str = r#"#!/bin/sh
if [ "$5" = j ]; then
    [ -r "$2" ] || exit 1
    cp "$1" "$4"
    cp "$1" "${4}_jSeqs.fa"
    : > "$3"
    exit 0
fi
[ -r "$3" ] || exit 1
case "$4" in
    v.*) cols="1,2"; vals="E,V" ;;
    *) cols="3,4"; vals="W,G" ;;
esac
{
    echo "Id,$cols"
    grep '^>' "$1" | sed 's/^>//' | while read -r id; do echo "$id,$vals"; done
} > "$4"
"#;

const FAKE_CONCATENATE: &str = r#"#!/bin/sh
{
    head -n 1 "$1" | tr -d '\n'
    head -n 1 "$2" | sed 's/^Id//'
    tail -n +2 "$1" | while IFS=, read -r id rest; do
        jrest=$(grep "^$id," "$2" | sed "s/^$id//")
        echo "$id,$rest$jrest"
    done
} > "$3"
echo "done $(pwd)" >> ../tool_calls.log
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Tool configuration pointing at the fake tools.
pub(crate) fn fake_tools() -> ToolEnv {
    static TOOLS: OnceLock<(TempDir, ToolEnv)> = OnceLock::new();
    TOOLS
        .get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let tools = ToolEnv {
                mafft: write_script(dir.path(), "mafft", FAKE_MAFFT),
                converter: write_script(dir.path(), "MafftGapConverter", FAKE_CONVERTER),
                concatenate: write_script(dir.path(), "concatenate", FAKE_CONCATENATE),
            };
            (dir, tools)
        })
        .1
        .clone()
}

/// Write V and J references into `dir` and return pipeline arguments using them.
pub(crate) fn pipeline_args(dir: &Path) -> PipelineArgs {
    let ref_v = dir.join("ref_v.fa");
    let ref_j = dir.join("ref_j.fa");
    fs::write(&ref_v, ">IGHV3-23\nEVQLLESGGGLVQPGGSLRLSCAASGFTFS\n").unwrap();
    fs::write(&ref_j, ">IGHJ4\nYFDYWGQGTLVTVSS\n").unwrap();
    PipelineArgs {
        ref_v,
        ref_j,
        keep_temp: false,
        keep_align: false,
        temp_root: None,
    }
}

/// Write a tab separated table with a `sequence_aa` column.
pub(crate) fn write_table(path: &Path, sequences: &[&str]) {
    let mut table = String::from("cell\tsequence_aa\n");
    for (i, seq) in sequences.iter().enumerate() {
        table.push_str(&format!("cell{i}\t{seq}\n"));
    }
    fs::write(path, table).unwrap();
}

/// Lines the fake tools logged in `dir`.
pub(crate) fn tool_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join(TOOL_LOG))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

/// Names of the workspaces left in `dir`.
pub(crate) fn workspaces_in(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(".mainiac_"))
        })
        .collect()
}
