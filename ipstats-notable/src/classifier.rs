//! Classifier
//!
//! For every species-level observation and every scope, decides whether the
//! observation is the first known record of its species in the scope and
//! whether the species is notable there.
//!
//! Oracle lookups are the only suspension points. They run on a bounded worker
//! pool, first over the distinct observed taxa (resolving each to its species)
//! and then over the distinct (species, scope) pairs; classification itself is
//! a synchronous pass in export order, so output never depends on the order in
//! which lookups complete.

use crate::oracle::{OccurrenceCache, OccurrenceFact, OccurrenceOracle, OccurrenceSource, OracleError};
use futures::stream::{self, StreamExt, TryStreamExt};
use ipstats_common::{Observation, ObservationId, Scope, ScopeHierarchy, TaxonId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Whole-run failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// Run cancelled or timed out; partial results were discarded
    #[error("classification cancelled after {completed} of {total} lookups")]
    Cancelled { completed: usize, total: usize },
}

/// Classifier settings
#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    /// Concurrent oracle lookups
    pub workers: usize,
    /// Keep casual-grade observations
    pub include_casual: bool,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            include_casual: false,
        }
    }
}

/// Result of classifying one observation at one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeOutcome {
    Classified {
        is_first: bool,
        is_notable: bool,
        /// Total observations of the species within the scope
        observation_count: u64,
    },
    /// The oracle could not answer; neither first nor notable
    Unknown(OracleError),
}

/// Classification of one observation at one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeClassification {
    pub scope_key: String,
    pub outcome: ScopeOutcome,
    /// The scope's first-observation text, present only when first
    pub first_text: Option<String>,
}

impl ScopeClassification {
    pub fn is_first(&self) -> bool {
        matches!(self.outcome, ScopeOutcome::Classified { is_first: true, .. })
    }

    pub fn is_notable(&self) -> bool {
        matches!(self.outcome, ScopeOutcome::Classified { is_notable: true, .. })
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.outcome, ScopeOutcome::Unknown(_))
    }

    pub fn observation_count(&self) -> Option<u64> {
        match self.outcome {
            ScopeOutcome::Classified { observation_count, .. } => Some(observation_count),
            ScopeOutcome::Unknown(_) => None,
        }
    }
}

/// An observation with one classification per scope, in hierarchy order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedObservation {
    pub observation: Observation,
    /// Species the observed taxon resolved to; the observed id when unresolved
    pub species_id: TaxonId,
    pub scopes: Vec<ScopeClassification>,
}

impl ClassifiedObservation {
    pub fn scope(&self, key: &str) -> Option<&ScopeClassification> {
        self.scopes.iter().find(|s| s.scope_key == key)
    }

    /// First text of the broadest scope this observation is first in
    pub fn highest_first_text(&self) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.first_text.as_deref())
    }
}

/// Rows left out of classification, each counted exactly once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionTally {
    /// Not identified to species level
    pub not_species_level: usize,
    /// Casual quality grade
    pub casual: usize,
    /// Repeated observation id
    pub duplicate: usize,
}

impl ExclusionTally {
    pub fn total(&self) -> usize {
        self.not_species_level + self.casual + self.duplicate
    }
}

/// Output of one classification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRun {
    /// Scopes in hierarchy order
    pub scopes: Vec<Scope>,
    /// Classified observations in export order
    pub classified: Vec<ClassifiedObservation>,
    pub excluded: ExclusionTally,
}

/// Split the export into classifiable observations and an exclusion tally
pub fn select_observations<'a>(
    observations: &'a [Observation],
    options: &ClassifyOptions,
) -> (Vec<&'a Observation>, ExclusionTally) {
    let mut tally = ExclusionTally::default();
    let mut seen: HashSet<ObservationId> = HashSet::new();
    let mut kept = Vec::new();

    for observation in observations {
        if !seen.insert(observation.id) {
            tally.duplicate += 1;
        } else if !observation.is_species_level() {
            tally.not_species_level += 1;
        } else if observation.quality_grade == ipstats_common::QualityGrade::Casual
            && !options.include_casual
        {
            tally.casual += 1;
        } else {
            kept.push(observation);
        }
    }

    (kept, tally)
}

/// Classify observations against every scope
///
/// Observed taxa are first resolved to their species, so a subspecies record
/// is judged against its species. Per-lookup failures degrade only the
/// affected (observation, scope) pair to [`ScopeOutcome::Unknown`].
/// Cancellation aborts the whole run between or during lookups and discards
/// everything computed so far.
pub async fn classify<S: OccurrenceSource>(
    observations: &[Observation],
    scopes: &ScopeHierarchy,
    oracle: &OccurrenceOracle<S>,
    cache: &OccurrenceCache,
    options: &ClassifyOptions,
    cancel: &CancellationToken,
) -> Result<ClassificationRun, ClassifyError> {
    let (kept, excluded) = select_observations(observations, options);

    let mut observed_taxa: Vec<TaxonId> = Vec::new();
    for taxon in kept.iter().filter_map(|o| o.species()) {
        if !observed_taxa.contains(&taxon.id) {
            observed_taxa.push(taxon.id);
        }
    }

    info!(
        observations = kept.len(),
        excluded = excluded.total(),
        taxa = observed_taxa.len(),
        workers = options.workers,
        "Classifying observations"
    );

    let species: HashMap<TaxonId, Result<TaxonId, OracleError>> = run_bounded(
        observed_taxa.clone(),
        options.workers,
        cancel,
        "taxa",
        move |taxon: TaxonId| oracle.resolve_species(cache, taxon),
    )
    .await?;

    // Distinct (species, scope) lookups in first-appearance order
    let mut seen_keys = HashSet::new();
    let mut keys: Vec<(TaxonId, usize)> = Vec::new();
    for resolved in observed_taxa.iter().filter_map(|t| species.get(t)?.as_ref().ok()) {
        for index in 0..scopes.len() {
            if seen_keys.insert((*resolved, index)) {
                keys.push((*resolved, index));
            }
        }
    }

    let scope_list = scopes.as_slice();
    let facts: HashMap<(TaxonId, usize), Result<OccurrenceFact, OracleError>> = run_bounded(
        keys,
        options.workers,
        cancel,
        "occurrences",
        move |(species_id, index): (TaxonId, usize)| oracle.lookup(cache, species_id, &scope_list[index]),
    )
    .await?;

    let classified = kept
        .into_iter()
        .filter_map(|observation| {
            let taxon = observation.species()?.id;
            let resolved = species.get(&taxon).cloned().unwrap_or_else(|| {
                Err(OracleError::UpstreamUnavailable("taxon not resolved".to_string()))
            });
            let scopes = scope_list
                .iter()
                .enumerate()
                .map(|(index, scope)| match &resolved {
                    Err(e) => unknown(scope, e.clone()),
                    Ok(species_id) => match facts.get(&(*species_id, index)) {
                        Some(Ok(fact)) => classify_at(observation, scope, fact),
                        Some(Err(e)) => unknown(scope, e.clone()),
                        // Every resolved (species, scope) pair was looked up above
                        None => unknown(
                            scope,
                            OracleError::UpstreamUnavailable("lookup missing".to_string()),
                        ),
                    },
                })
                .collect();
            Some(ClassifiedObservation {
                observation: observation.clone(),
                species_id: resolved.unwrap_or(taxon),
                scopes,
            })
        })
        .collect::<Vec<_>>();

    let firsts = classified
        .iter()
        .flat_map(|c| c.scopes.iter())
        .filter(|s| s.is_first())
        .count();
    let unknowns = classified
        .iter()
        .flat_map(|c| c.scopes.iter())
        .filter(|s| s.is_unknown())
        .count();
    info!(
        classified = classified.len(),
        firsts,
        unknowns,
        upstream_queries = cache.upstream_queries(),
        "Classification complete"
    );

    Ok(ClassificationRun {
        scopes: scope_list.to_vec(),
        classified,
        excluded,
    })
}

/// Run `task` for every key on at most `workers` concurrent tasks
///
/// Stops at the first cancellation and returns nothing computed so far.
async fn run_bounded<K, V, F, Fut>(
    keys: Vec<K>,
    workers: usize,
    cancel: &CancellationToken,
    phase: &'static str,
    task: F,
) -> Result<HashMap<K, V>, ClassifyError>
where
    K: Eq + Hash + Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = V>,
{
    let total = keys.len();
    let completed = AtomicUsize::new(0);
    let completed = &completed;
    let task = &task;

    stream::iter(keys)
        .map(|key| async move {
            let cancelled = || ClassifyError::Cancelled {
                completed: completed.load(Ordering::Relaxed),
                total,
            };
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let value = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                value = task(key.clone()) => value,
            };

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 50 == 0 || done == total {
                info!(phase, done, total, "Oracle lookups");
            }
            Ok((key, value))
        })
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await
}

/// Classify one observation against a known fact
///
/// First iff the observation is exactly the fact's earliest record; ties on
/// timestamp are already resolved by the record order (lowest id wins).
/// Notability depends only on the count.
pub fn classify_at(observation: &Observation, scope: &Scope, fact: &OccurrenceFact) -> ScopeClassification {
    let is_first = match (observation.occurrence_record(), fact.earliest) {
        (Some(own), Some(earliest)) => own == earliest,
        _ => false,
    };
    let is_notable = scope.is_notable(fact.count);

    if is_first {
        debug!(observation_id = observation.id, scope = %scope.key, "First observation");
    }

    ScopeClassification {
        scope_key: scope.key.clone(),
        outcome: ScopeOutcome::Classified {
            is_first,
            is_notable,
            observation_count: fact.count,
        },
        first_text: is_first.then(|| scope.first_text.clone()),
    }
}

fn unknown(scope: &Scope, error: OracleError) -> ScopeClassification {
    ScopeClassification {
        scope_key: scope.key.clone(),
        outcome: ScopeOutcome::Unknown(error),
        first_text: None,
    }
}
