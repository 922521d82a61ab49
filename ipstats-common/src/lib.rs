//! # ipstats Common Library
//!
//! Shared code for the iNaturalist project statistics tools:
//! - Error type
//! - Project configuration loading
//! - Scope hierarchy (nested places ending in "global")
//! - Observation model and CSV export reader

pub mod config;
pub mod error;
pub mod export;
pub mod observation;
pub mod scope;

pub use error::{Error, Result, ValidationError};
pub use observation::{
    Coordinates, Lineage, Observation, ObservationId, ObservedTaxon, OccurrenceRecord, QualityGrade, TaxonId,
};
pub use scope::{Scope, ScopeHierarchy, ScopeId};
