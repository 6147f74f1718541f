//! Merge the per-sample Output Tables of a MAINIAC batch into one dataset.

mod errors;
pub mod merge;
pub mod numbering;
pub mod output_table;

pub use errors::AggregationError;
pub use merge::{merge_tables, MergeOptions, MergedDataset, MergedRow};
