use rip_core::{CanonicalError, ValidationReport};
use rip_fetch::FetchSetupError;
use rip_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bundle validation failed with {} error(s)", .0.errors.len())]
    Validation(ValidationReport),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("{0}")]
    NotReviewable(String),

    #[error("{0}")]
    InvalidInput(String),

    /// Proposal rejected at job time. Never retried.
    #[error("{0}")]
    Ingestion(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    #[error(transparent)]
    FetchSetup(#[from] FetchSetupError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Job-level errors that must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::RunNotFound(_) | Self::NotReviewable(_) | Self::InvalidInput(_) | Self::Ingestion(_)
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
