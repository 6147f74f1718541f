//! Input tables and the FASTA handed to the aligner.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Values that mean "no sequence" in an input table, the default missing
/// value markers of pandas.
const MISSING_VALUES: [&str; 18] = [
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

fn is_missing(value: &str) -> bool {
    value.is_empty() || MISSING_VALUES.contains(&value)
}

/// Field separator of an input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separator(u8);

impl Separator {
    pub const TAB: Separator = Separator(b'\t');

    pub fn as_byte(self) -> u8 {
        self.0
    }
}

impl Default for Separator {
    fn default() -> Self {
        Separator::TAB
    }
}

impl FromStr for Separator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Separator> {
        match s {
            "\\t" | "tab" | "\t" => Ok(Separator::TAB),
            _ => match s.as_bytes() {
                [b] if b.is_ascii() && *b != b'\n' && *b != b'"' => Ok(Separator(*b)),
                _ => bail!("expected a single ASCII character, \\t or tab, got {s:?}"),
            },
        }
    }
}

impl Display for Separator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if *self == Separator::TAB {
            f.write_str("\\t")
        } else {
            write!(f, "{}", self.0 as char)
        }
    }
}

/// One extracted sequence. The index is dense over the retained sequences of
/// a sample, so dropped rows never leave a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub index: usize,
    pub sequence: String,
}

impl SequenceRecord {
    /// The FASTA header and Output Table row id of this sequence.
    pub fn id(&self) -> String {
        format!("q{}", self.index)
    }
}

/// Write `records` as FASTA, one two-line record each.
pub fn write_fasta(records: &[SequenceRecord], mut out: impl Write) -> io::Result<()> {
    for record in records {
        writeln!(out, ">{}", record.id())?;
        writeln!(out, "{}", record.sequence)?;
    }
    out.flush()
}

/// One input table.
#[derive(Debug, Clone)]
pub struct Sample {
    pub source: PathBuf,
    pub separator: Separator,
    pub seq_col: String,
}

impl Sample {
    pub fn new(source: impl Into<PathBuf>, separator: Separator, seq_col: &str) -> Self {
        Sample {
            source: source.into(),
            separator,
            seq_col: seq_col.to_string(),
        }
    }

    /// File stem of the table, used to name its Output Table.
    pub fn name(&self) -> String {
        self.source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.source
    }

    /// Read the non-missing values of the sequence column, trimmed, in row order.
    ///
    /// Rows with more fields than the header are skipped. Short rows are kept
    /// and their absent fields count as missing.
    pub fn read_sequences(&self) -> Result<Vec<SequenceRecord>> {
        let source = self.source.display();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.separator.as_byte())
            .flexible(true)
            .from_path(&self.source)
            .with_context(|| format!("unable to read {source}"))?;
        let headers = reader
            .headers()
            .with_context(|| format!("unable to read the header of {source}"))?;
        let width = headers.len();
        let column = headers
            .iter()
            .position(|name| name.trim() == self.seq_col)
            .with_context(|| format!("column {:?} not found in {source}", self.seq_col))?;

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) if err.is_io_error() => {
                    return Err(err).with_context(|| format!("unable to read {source}"));
                }
                Err(err) => {
                    debug!("{source}: skipping malformed row {}: {err}", row + 1);
                    continue;
                }
            };
            if record.len() > width {
                debug!(
                    "{source}: skipping row {} with {} fields, expected {width}",
                    row + 1,
                    record.len()
                );
                continue;
            }
            let Some(sequence) = record.get(column).map(str::trim) else {
                continue;
            };
            if is_missing(sequence) {
                continue;
            }
            records.push(SequenceRecord {
                index: records.len(),
                sequence: sequence.to_string(),
            });
        }
        Ok(records)
    }
}
