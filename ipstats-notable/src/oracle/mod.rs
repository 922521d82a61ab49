//! Occurrence Oracle
//!
//! Answers, per (species, scope): what is the earliest known observation of
//! the species in the scope, and how many observations exist there in total.
//!
//! The authoritative data lives upstream behind an [`OccurrenceSource`]. Facts
//! are memoised in an [`OccurrenceCache`] that lives for exactly one run and
//! is passed in explicitly. A fact is a snapshot taken at query time:
//! observations uploaded afterwards are not reflected, and the cache is never
//! invalidated during a run.

mod memory;
mod reduce;
mod single_flight;

pub use memory::MemorySource;
pub use reduce::reduce_pages;
pub use single_flight::SingleFlight;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use ipstats_common::{OccurrenceRecord, Scope, ScopeId, TaxonId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Source Types
// ============================================================================

/// Taxon as resolved by the upstream source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonRecord {
    pub id: TaxonId,
    pub name: String,
    pub rank: String,
    pub is_active: bool,
    pub preferred_common_name: Option<String>,
    /// Species-rank ancestor of an infraspecific taxon (subspecies, variety, form)
    #[serde(default)]
    pub species_ancestor: Option<TaxonId>,
}

impl TaxonRecord {
    pub fn species(id: TaxonId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            rank: "species".to_string(),
            is_active: true,
            preferred_common_name: None,
            species_ancestor: None,
        }
    }

    /// Active infraspecific taxon below `species`
    pub fn infraspecific(id: TaxonId, name: impl Into<String>, rank: impl Into<String>, species: TaxonId) -> Self {
        Self {
            rank: rank.into(),
            species_ancestor: Some(species),
            ..Self::species(id, name)
        }
    }

    /// The single species this record identifies, if any
    ///
    /// A species resolves to itself and an infraspecific taxon to its species
    /// ancestor. Coarser ranks and inactive taxa resolve to none.
    pub fn species_id(&self) -> Option<TaxonId> {
        if !self.is_active {
            return None;
        }
        if self.rank == "species" {
            Some(self.id)
        } else {
            self.species_ancestor
        }
    }

    /// Species id for a lookup of `requested`; a record for another id never resolves
    pub fn resolves_species(&self, requested: TaxonId) -> Option<TaxonId> {
        if self.id == requested {
            self.species_id()
        } else {
            None
        }
    }
}

/// One upstream observation on a result page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: u64,
    /// Absent when the upstream record has no observation date
    pub observed_at: Option<DateTime<Utc>>,
}

impl PageRecord {
    pub fn to_record(&self) -> Option<OccurrenceRecord> {
        self.observed_at.map(|observed_at| OccurrenceRecord {
            id: self.id,
            observed_at,
        })
    }
}

/// One page of an occurrence search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrencePage {
    pub records: Vec<PageRecord>,
    /// Total matches reported by the source, if it reports one
    pub total_results: Option<u64>,
    /// Lower bound on the timestamp of every record on later pages
    ///
    /// Only sources returning results in ascending date order can set this.
    pub floor: Option<DateTime<Utc>>,
}

/// Failures reported by a source after its own retry policy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected upstream response: {0}")]
    InvalidResponse(String),
}

/// Paginated, place-scoped, species-scoped occurrence search
#[async_trait]
pub trait OccurrenceSource: Send + Sync {
    /// Look up a taxon by id
    async fn resolve_taxon(&self, taxon_id: TaxonId) -> Result<TaxonRecord, SourceError>;

    /// Lazily stream result pages for a taxon within a scope
    ///
    /// Every call starts a fresh sequence from the first page.
    fn occurrences<'a>(
        &'a self,
        taxon_id: TaxonId,
        scope: &'a ScopeId,
    ) -> BoxStream<'a, Result<OccurrencePage, SourceError>>;
}

// ============================================================================
// Oracle
// ============================================================================

/// Earliest known record and total count of a species within a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceFact {
    pub earliest: Option<OccurrenceRecord>,
    pub count: u64,
}

/// Per-lookup oracle failures
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleError {
    #[error("occurrence data unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("taxon {taxon_id} does not resolve to a single species (rank: {rank})")]
    AmbiguousTaxon { taxon_id: TaxonId, rank: String },
}

/// Cache key: exactly (species id, scope identifier)
pub type FactKey = (TaxonId, ScopeId);

/// Memoised oracle answers for one run
///
/// Errors are memoised too, so every caller in a run sees the same answer for
/// a key. Drop the cache to start a new run.
#[derive(Default)]
pub struct OccurrenceCache {
    /// Observed taxon id to species id
    taxa: SingleFlight<TaxonId, Result<TaxonId, OracleError>>,
    facts: SingleFlight<FactKey, Result<OccurrenceFact, OracleError>>,
    upstream_queries: AtomicUsize,
}

impl OccurrenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream queries started through this cache (taxon and occurrence)
    pub fn upstream_queries(&self) -> usize {
        self.upstream_queries.load(Ordering::Relaxed)
    }

    /// Cached fact for a key, if its lookup has finished
    pub fn fact(&self, key: &FactKey) -> Option<Result<OccurrenceFact, OracleError>> {
        self.facts.get(key)
    }

    /// Number of (species, scope) pairs with a finished lookup
    pub fn facts_cached(&self) -> usize {
        self.facts.completed()
    }

    fn count_query(&self) {
        self.upstream_queries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Occurrence Oracle over an upstream source
pub struct OccurrenceOracle<S> {
    source: S,
}

impl<S: OccurrenceSource> OccurrenceOracle<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Earliest record and count of the species of `taxon` within `scope`
    ///
    /// `taxon` is first resolved to its species; facts are keyed by the
    /// species id, so a subspecies and its parent share one answer. Safe to
    /// call concurrently. Concurrent calls for the same key share one
    /// upstream query and receive the same result.
    pub async fn lookup(
        &self,
        cache: &OccurrenceCache,
        taxon: TaxonId,
        scope: &Scope,
    ) -> Result<OccurrenceFact, OracleError> {
        let species = self.resolve_species(cache, taxon).await?;

        let key: FactKey = (species, scope.id.clone());
        cache
            .facts
            .get_or_init(&key, || async {
                cache.count_query();
                debug!(taxon_id = species, scope = %scope.key, "Querying occurrences");

                let result = reduce_pages(self.source.occurrences(species, &scope.id))
                    .await
                    .map_err(|e| OracleError::UpstreamUnavailable(e.to_string()));

                match &result {
                    Ok(fact) => debug!(
                        taxon_id = species,
                        scope = %scope.key,
                        count = fact.count,
                        earliest = ?fact.earliest.map(|r| r.id),
                        "Occurrence fact computed"
                    ),
                    Err(e) => warn!(
                        taxon_id = species,
                        scope = %scope.key,
                        error = %e,
                        "Occurrence lookup failed"
                    ),
                }
                result
            })
            .await
    }

    /// Resolve a taxon id to the id of the single active species it identifies
    pub async fn resolve_species(&self, cache: &OccurrenceCache, taxon: TaxonId) -> Result<TaxonId, OracleError> {
        cache
            .taxa
            .get_or_init(&taxon, || async {
                cache.count_query();
                match self.source.resolve_taxon(taxon).await {
                    Ok(record) => match record.resolves_species(taxon) {
                        Some(species) => {
                            if species != taxon {
                                debug!(
                                    taxon_id = taxon,
                                    species_id = species,
                                    rank = %record.rank,
                                    "Resolved to species ancestor"
                                );
                            }
                            Ok(species)
                        }
                        None => {
                            warn!(
                                taxon_id = taxon,
                                resolved_id = record.id,
                                rank = %record.rank,
                                active = record.is_active,
                                "Taxon is not a single active species"
                            );
                            Err(OracleError::AmbiguousTaxon {
                                taxon_id: taxon,
                                rank: record.rank,
                            })
                        }
                    },
                    Err(SourceError::NotFound(_)) => Err(OracleError::AmbiguousTaxon {
                        taxon_id: taxon,
                        rank: "unknown".to_string(),
                    }),
                    Err(e) => Err(OracleError::UpstreamUnavailable(e.to_string())),
                }
            })
            .await
    }
}
