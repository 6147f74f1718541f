//! Merge the Output Tables of a batch into one dataset.

use crate::errors::AggregationError;
use crate::numbering::column_order;
use crate::output_table::OutputTable;
use anyhow::{Context, Result};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MERGED_FILE: &str = "merged.bincode";
pub const COUNT_FILE: &str = "merged_count.json";
pub const TSV_FILE: &str = "merged.tsv";

/// The numbering tools report no alignment quality, so every row gets the
/// same score.
pub const PLACEHOLDER_QUALITY: f64 = 1.0;

/// Cell written to the TSV for a position a row has no residue at.
const GAP: &str = "-";

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Collapse rows of a sample with identical numbered residues.
    pub clonotype: bool,
    /// Order the TSV rows by the number of residues.
    pub sort_by_length: bool,
    /// Also write the merged dataset as `merged.tsv`.
    pub write_tsv: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRow {
    /// `{sample_index}-{local_row_index}`.
    pub sequence_id: String,
    pub sample_index: usize,
    pub sample: String,
    pub quality: f64,
    /// Number of rows collapsed into this one, in clonotype mode.
    pub clonotype_count: Option<usize>,
    /// Column label and residue, in the column order of the Output Table.
    pub numbering: Vec<(String, String)>,
}

impl MergedRow {
    /// Number of positions holding a residue.
    pub fn pseudo_length(&self) -> usize {
        self.numbering
            .iter()
            .filter(|(_, residue)| !residue.is_empty() && residue != GAP)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCount {
    pub entries: usize,
    pub samples: usize,
}

/// What [`merge_tables`] wrote.
#[derive(Debug)]
pub struct MergedDataset {
    pub rows: Vec<MergedRow>,
    pub count: EntryCount,
    pub merged: PathBuf,
    pub count_json: PathBuf,
    pub tsv: Option<PathBuf>,
}

/// Rewrite the rows of one table, the table at `sample_index` of the batch.
fn sample_rows(table: &OutputTable, sample_index: usize, clonotype: bool) -> Vec<MergedRow> {
    let sample = table.sample_name();
    let rows = table
        .rows
        .iter()
        .enumerate()
        .map(|(local_row_index, row)| MergedRow {
            sequence_id: format!("{sample_index}-{local_row_index}"),
            sample_index,
            sample: sample.clone(),
            quality: PLACEHOLDER_QUALITY,
            clonotype_count: None,
            numbering: table
                .columns
                .iter()
                .cloned()
                .zip(row.residues.iter().cloned())
                .collect(),
        });
    if !clonotype {
        return rows.collect();
    }

    let mut collapsed: Vec<MergedRow> = Vec::new();
    let mut first_of: HashMap<Vec<String>, usize> = HashMap::new();
    for mut row in rows {
        let residues: Vec<String> = row.numbering.iter().map(|(_, r)| r.clone()).collect();
        match first_of.get(&residues) {
            Some(&pos) => {
                if let Some(count) = collapsed[pos].clonotype_count.as_mut() {
                    *count += 1;
                }
            }
            None => {
                first_of.insert(residues, collapsed.len());
                row.clonotype_count = Some(1);
                collapsed.push(row);
            }
        }
    }
    collapsed
}

/// Rewrite the rows of every table, in batch order.
pub fn merge_rows(tables: &[OutputTable], clonotype: bool) -> Vec<MergedRow> {
    tables
        .iter()
        .enumerate()
        .flat_map(|(sample_index, table)| sample_rows(table, sample_index, clonotype))
        .collect()
}

/// Read the Output Tables of a batch, listed in job index order, and write
/// the merged dataset into `db_dir`.
pub fn merge_tables(outputs: &[PathBuf], db_dir: &Path, opts: MergeOptions) -> Result<MergedDataset> {
    if outputs.is_empty() {
        return Err(AggregationError::EmptyBatch.into());
    }
    let mut tables = Vec::with_capacity(outputs.len());
    for (sample_index, path) in outputs.iter().enumerate() {
        if !path.is_file() {
            return Err(AggregationError::MissingOutput {
                sample_index,
                path: path.clone(),
            }
            .into());
        }
        tables.push(OutputTable::read(path)?);
    }

    let rows = merge_rows(&tables, opts.clonotype);
    let count = EntryCount {
        entries: rows.len(),
        samples: tables.len(),
    };

    fs::create_dir_all(db_dir).with_context(|| db_dir.display().to_string())?;
    let merged = db_dir.join(MERGED_FILE);
    let mut writer =
        BufWriter::new(File::create(&merged).with_context(|| merged.display().to_string())?);
    bincode::serialize_into(&mut writer, &rows)
        .with_context(|| format!("unable to write {}", merged.display()))?;
    writer.flush()?;

    let count_json = db_dir.join(COUNT_FILE);
    let mut writer = BufWriter::new(
        File::create(&count_json).with_context(|| count_json.display().to_string())?,
    );
    serde_json::to_writer_pretty(&mut writer, &count)
        .with_context(|| format!("unable to write {}", count_json.display()))?;
    writer.flush()?;

    let tsv = if opts.write_tsv {
        let path = db_dir.join(TSV_FILE);
        let columns = tables
            .iter()
            .flat_map(|table| table.columns.iter())
            .unique()
            .sorted_by(|a, b| column_order(a, b))
            .collect::<Vec<_>>();
        write_tsv(&path, &rows, &columns, opts)?;
        Some(path)
    } else {
        None
    };

    info!(
        "merged {} entries from {} samples into {}",
        count.entries,
        count.samples,
        db_dir.display()
    );
    Ok(MergedDataset {
        rows,
        count,
        merged,
        count_json,
        tsv,
    })
}

fn write_tsv(path: &Path, rows: &[MergedRow], columns: &[&String], opts: MergeOptions) -> Result<()> {
    let mut order: Vec<&MergedRow> = rows.iter().collect();
    if opts.sort_by_length {
        order.sort_by_key(|row| row.pseudo_length());
    }

    let mut out = BufWriter::new(File::create(path).with_context(|| path.display().to_string())?);
    let mut header = vec!["sequence_id", "sample_index", "quality"];
    if opts.clonotype {
        header.push("clonotype_count");
    }
    header.extend(columns.iter().map(|c| c.as_str()));
    writeln!(out, "{}", header.join("\t"))?;

    for row in order {
        let residues: HashMap<&str, &str> = row
            .numbering
            .iter()
            .map(|(label, residue)| (label.as_str(), residue.as_str()))
            .collect();
        let mut fields = vec![
            row.sequence_id.clone(),
            row.sample_index.to_string(),
            row.quality.to_string(),
        ];
        if opts.clonotype {
            fields.push(row.clonotype_count.unwrap_or(1).to_string());
        }
        fields.extend(columns.iter().map(|label| {
            match residues.get(label.as_str()) {
                Some(residue) if !residue.is_empty() => residue.to_string(),
                _ => GAP.to_string(),
            }
        }));
        writeln!(out, "{}", fields.join("\t"))?;
    }
    out.flush()
        .with_context(|| format!("unable to write {}", path.display()))
}

/// Read back a dataset written by [`merge_tables`].
pub fn read_merged(path: &Path) -> Result<Vec<MergedRow>> {
    let file = File::open(path).with_context(|| path.display().to_string())?;
    bincode::deserialize_from(std::io::BufReader::new(file))
        .with_context(|| format!("unable to read {}", path.display()))
}
