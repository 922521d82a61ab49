//! Error types for ipstats-notable

use crate::classifier::ClassifyError;
use crate::services::INatError;
use thiserror::Error;

/// Whole-run analysis error
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Configuration, validation or export problem
    #[error(transparent)]
    Common(#[from] ipstats_common::Error),

    /// Run cancelled or timed out; no output was written
    #[error("analysis cancelled: {0}")]
    Cancelled(#[from] ClassifyError),

    /// Timeout elapsed before classification finished
    #[error("analysis timed out after {0}s")]
    TimedOut(u64),

    /// HTTP client could not be constructed
    #[error("iNaturalist client error: {0}")]
    Client(#[from] INatError),

    /// Writing report output failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing species CSV failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Formatting an HTML page failed
    #[error("render error: {0}")]
    Render(#[from] std::fmt::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
