//! ipstats-notable library interface
//!
//! Finds first and notable observations in an iNaturalist project export:
//! for each species-level observation and each configured place, whether it
//! is the earliest known record of its species there and whether the species
//! is rare there. Also lists priority observations: unidentified records in
//! genera the project has no species for yet.

pub mod aggregator;
pub mod classifier;
pub mod error;
pub mod oracle;
pub mod pipeline;
pub mod render;
pub mod services;

pub use crate::aggregator::{aggregate, priority_observations, PriorityObservation, Report};
pub use crate::classifier::{classify, ClassificationRun, ClassifyError, ClassifyOptions};
pub use crate::error::{AnalysisError, Result};
pub use crate::oracle::{OccurrenceCache, OccurrenceFact, OccurrenceOracle, OccurrenceSource, OracleError};
pub use crate::pipeline::{run_analysis, AnalysisOutput, RunOverrides};
