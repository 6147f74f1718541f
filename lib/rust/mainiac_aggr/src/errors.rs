use itertools::Itertools;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("The batch produced no Output Tables to aggregate.")]
    EmptyBatch,

    #[error(
        "The Output Table of sample {sample_index} does not exist: {path:?}. \
         Aggregation requires every job of the batch to succeed."
    )]
    MissingOutput { sample_index: usize, path: PathBuf },

    #[error("The Output Table {path:?} has no Id column.")]
    MissingIdColumn { path: PathBuf },

    #[error("Unable to read the Output Table {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(
        "Refusing to aggregate: {} of {total} jobs did not succeed ({}).",
        .failed.len(),
        .failed.iter().join(", ")
    )]
    IncompleteBatch { failed: Vec<String>, total: usize },
}
