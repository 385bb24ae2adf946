use std::path::PathBuf;

use idwatch_adapters::ApiError;
use idwatch_core::{DescriptorError, SortOrderViolation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dump {} already exists", path.display())]
    DumpExists { path: PathBuf },
    #[error("incomplete fetch: processed {processed} of {total} records")]
    IncompleteFetch { processed: u64, total: u64 },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Unsorted(#[from] SortOrderViolation),
    #[error("snapshot ids out of order: {current:?} follows {previous:?}")]
    UnsortedSnapshot { previous: String, current: String },
    #[error("snapshot writer stopped before the fetch finished")]
    WriterClosed,
    #[error("rebuilding table {table} failed: {source:#}")]
    Schema {
        table: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DescriptorError> for PipelineError {
    fn from(err: DescriptorError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl PipelineError {
    /// Configuration problems, the once-per-day guard and ordering violations
    /// never go away on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::DumpExists { .. }
                | PipelineError::UnsortedSnapshot { .. }
                | PipelineError::Unsorted(_)
        )
    }
}
