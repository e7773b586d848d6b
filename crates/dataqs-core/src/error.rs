//! Run-level error taxonomy

use dataqs_common::DataqsError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::normalize::NormalizationError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures that abort a stage of a run.
///
/// Conflicting inserts are not errors: they surface as
/// [`InsertOutcome::ConflictSkipped`](crate::store::InsertOutcome).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Resource {resource} unavailable after {attempts} attempts")]
    ResourceUnavailable { resource: String, attempts: usize },

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("Swap into {dataset} failed and was rolled back: {source}")]
    PublishSwapFailure {
        dataset: String,
        #[source]
        source: StoreError,
    },

    #[error("Interrupted swap on {dataset}, manual inspection required: {detail}")]
    InterruptedSwap { dataset: String, detail: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Staging error: {0}")]
    Staging(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error(transparent)]
    Common(#[from] DataqsError),
}

impl PipelineError {
    pub fn feed(msg: impl Into<String>) -> Self {
        PipelineError::Feed(msg.into())
    }

    /// Store-wide outages end the run; nothing else should be retried blindly.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            PipelineError::StoreUnavailable(err.to_string())
        } else {
            PipelineError::Store(err)
        }
    }
}
