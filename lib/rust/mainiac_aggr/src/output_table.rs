//! Reading the per-sample Output Tables.

use crate::errors::AggregationError;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Header of the pass-through row identifier column.
pub const ID_COLUMN: &str = "Id";

/// One numbered sequence of an Output Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedRow {
    /// `i` of the `q{i}` row id.
    pub query_index: usize,
    /// One residue per column of the table.
    pub residues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OutputTable {
    pub path: PathBuf,
    /// Numbering column labels, without the identifier column.
    pub columns: Vec<String>,
    /// Rows ordered by query index.
    pub rows: Vec<NumberedRow>,
}

/// Columns written by a dataframe index rather than the numbering tools.
fn is_index_column(name: &str) -> bool {
    name.is_empty() || name.starts_with("Unnamed:")
}

fn query_index(id: &str) -> Option<usize> {
    id.strip_prefix('q')?.parse().ok()
}

impl OutputTable {
    pub fn read(path: &Path) -> Result<OutputTable, AggregationError> {
        let read_error = |source| AggregationError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(read_error)?;

        let headers = reader.headers().map_err(read_error)?.clone();
        let id_pos = headers
            .iter()
            .position(|name| name.trim() == ID_COLUMN)
            .ok_or_else(|| AggregationError::MissingIdColumn {
                path: path.to_path_buf(),
            })?;

        // Repeated labels get a `.1`, `.2`, ... suffix.
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut kept = Vec::new();
        let mut columns = Vec::new();
        for (pos, name) in headers.iter().enumerate() {
            let name = name.trim();
            if pos == id_pos || is_index_column(name) {
                continue;
            }
            let copies = seen.entry(name).or_default();
            columns.push(match *copies {
                0 => name.to_string(),
                n => format!("{name}.{n}"),
            });
            *copies += 1;
            kept.push(pos);
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(read_error)?;
            let id = record.get(id_pos).unwrap_or_default().trim();
            let Some(query_index) = query_index(id) else {
                debug!("{}: skipping row {id:?}", path.display());
                continue;
            };
            let residues = kept
                .iter()
                .map(|&pos| record.get(pos).unwrap_or_default().trim().to_string())
                .collect();
            rows.push(NumberedRow {
                query_index,
                residues,
            });
        }
        // The concatenation tool writes rows in no particular order.
        rows.sort_by_key(|row| row.query_index);

        Ok(OutputTable {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    /// Name of the sample: `a` for `a.out.csv`.
    pub fn sample_name(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match file_name.strip_suffix(".out.csv") {
            Some(name) => name.to_string(),
            None => self
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}
