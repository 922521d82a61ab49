//! Aggregator
//!
//! Groups a classification run by species, by scope and by observer into the
//! structure the renderers consume. Pure: no I/O, no clock.

use crate::classifier::{ClassificationRun, ClassifiedObservation, ExclusionTally};
use ipstats_common::{Lineage, Observation, ObservationId, ObservedTaxon, QualityGrade, Scope, TaxonId};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Rendering-ready result of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Scopes in hierarchy order with their first/notable lists
    pub scopes: Vec<ScopeSection>,
    /// Species roll-up, alphabetical by scientific name then id
    pub species: Vec<SpeciesSummary>,
    /// Observers in order of first appearance in the export
    pub observers: Vec<ObserverSection>,
    pub excluded: ExclusionTally,
    /// Observations that went through classification
    pub classified_observations: usize,
}

impl Report {
    pub fn species(&self, taxon_id: TaxonId) -> Option<&SpeciesSummary> {
        self.species.iter().find(|s| s.taxon_id == taxon_id)
    }

    pub fn observer(&self, login: &str) -> Option<&ObserverSection> {
        self.observers.iter().find(|o| o.login == login)
    }

    pub fn scope(&self, key: &str) -> Option<&ScopeSection> {
        self.scopes.iter().find(|s| s.scope.key == key)
    }

    /// Total uniquely observed species across observers
    pub fn uniquely_observed_count(&self) -> usize {
        self.observers.iter().map(|o| o.unique_species.len()).sum()
    }
}

/// The project observation credited as first within a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirstEntry {
    pub taxon_id: TaxonId,
    pub observation_id: ObservationId,
    pub observer: String,
    pub research_grade: bool,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// A species notable within a scope but not first there
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotableEntry {
    pub taxon_id: TaxonId,
    /// Observations of the species within the scope
    pub scope_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSection {
    pub scope: Scope,
    /// Alphabetical by species
    pub firsts: Vec<FirstEntry>,
    /// Ascending by scope count, then species
    pub notables: Vec<NotableEntry>,
    /// Observations whose classification here is unknown
    pub unknown: usize,
}

/// Per-scope status of a species
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeciesScopeStatus {
    pub scope_key: String,
    pub first: Option<ObservationId>,
    pub notable: bool,
    /// `None` when the oracle could not answer for this scope
    pub scope_count: Option<u64>,
}

/// Species credited to a single observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniqueSpecies {
    pub taxon_id: TaxonId,
    pub has_research_grade: bool,
    /// Observers without research-grade observations of it
    pub other_observers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesSummary {
    pub taxon_id: TaxonId,
    /// Sort key; the taxon's scientific name or its id
    pub scientific_name: String,
    pub taxon: ObservedTaxon,
    /// Distinct observers, first appearance order
    pub observers: Vec<String>,
    pub research_grade_observers: Vec<String>,
    /// Project observations of the species
    pub project_count: usize,
    /// One entry per scope, hierarchy order
    pub scopes: Vec<SpeciesScopeStatus>,
    /// First text of the broadest scope the species is first in
    pub highest_first_text: Option<String>,
    /// Observer credited with a unique observation, if any
    pub unique_to: Option<String>,
}

impl SpeciesSummary {
    pub fn is_notable(&self) -> bool {
        self.scopes.iter().any(|s| s.notable)
    }

    pub fn scope(&self, key: &str) -> Option<&SpeciesScopeStatus> {
        self.scopes.iter().find(|s| s.scope_key == key)
    }

    pub fn has_research_grade_from(&self, login: &str) -> bool {
        self.research_grade_observers.iter().any(|o| o == login)
    }
}

/// One observation as listed under its observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObserverEntry {
    pub observation_id: ObservationId,
    pub taxon_id: TaxonId,
    /// Keys of the scopes this observation is first in
    pub first_in: Vec<String>,
    /// Keys of the scopes the species is notable in
    pub notable_in: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObserverSection {
    pub login: String,
    /// Classified observations in export order
    pub observations: Vec<ObserverEntry>,
    /// Uniquely observed species, alphabetical
    pub unique_species: Vec<UniqueSpecies>,
}

impl ObserverSection {
    pub fn first_count(&self) -> usize {
        self.observations.iter().filter(|o| !o.first_in.is_empty()).count()
    }

    /// Observations that are first or notable somewhere, export order
    pub fn highlights(&self) -> impl Iterator<Item = &ObserverEntry> {
        self.observations
            .iter()
            .filter(|o| !o.first_in.is_empty() || !o.notable_in.is_empty())
    }

    /// Anything worth listing under this observer
    pub fn has_highlights(&self) -> bool {
        !self.unique_species.is_empty() || self.highlights().next().is_some()
    }
}

/// A not-yet-research-grade observation in a genus with no species-level
/// observation in the project
///
/// Identifying it to species would add a species the project does not have yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityObservation {
    pub observation_id: ObservationId,
    pub observer: String,
    pub taxon_name: String,
    pub lineage: Lineage,
    pub url: Option<String>,
    pub image_url: Option<String>,
}

// ============================================================================
// Aggregation
// ============================================================================

/// Build the report for a classification run
pub fn aggregate(run: &ClassificationRun) -> Report {
    let species = species_rollup(run);
    let order: HashMap<TaxonId, usize> = species
        .iter()
        .enumerate()
        .map(|(i, s)| (s.taxon_id, i))
        .collect();
    let rank = |taxon: TaxonId| order.get(&taxon).copied().unwrap_or(usize::MAX);

    let scopes = run
        .scopes
        .iter()
        .enumerate()
        .map(|(index, scope)| scope_section(run, &species, index, scope, &rank))
        .collect();

    let observers = observer_sections(run, &species, &rank);

    Report {
        scopes,
        species,
        observers,
        excluded: run.excluded,
        classified_observations: run.classified.len(),
    }
}

fn compare_species(a: &SpeciesSummary, b: &SpeciesSummary) -> Ordering {
    a.scientific_name
        .cmp(&b.scientific_name)
        .then(a.taxon_id.cmp(&b.taxon_id))
}

fn species_rollup(run: &ClassificationRun) -> Vec<SpeciesSummary> {
    let mut by_taxon: HashMap<TaxonId, Vec<&ClassifiedObservation>> = HashMap::new();
    let mut taxa_order: Vec<TaxonId> = Vec::new();
    for classified in &run.classified {
        let taxon = classified.species_id;
        by_taxon
            .entry(taxon)
            .or_insert_with(|| {
                taxa_order.push(taxon);
                Vec::new()
            })
            .push(classified);
    }

    let mut species: Vec<SpeciesSummary> = taxa_order
        .into_iter()
        .filter_map(|taxon_id| {
            let observations = by_taxon.remove(&taxon_id)?;
            Some(summarise_species(run, taxon_id, &observations))
        })
        .collect();
    species.sort_by(compare_species);
    species
}

fn summarise_species(
    run: &ClassificationRun,
    taxon_id: TaxonId,
    observations: &[&ClassifiedObservation],
) -> SpeciesSummary {
    // Prefer a row identified exactly as the species over a subspecies row
    let taxon = observations
        .iter()
        .filter_map(|c| c.observation.species())
        .find(|t| t.id == taxon_id)
        .cloned()
        .or_else(|| {
            let infraspecific = observations.iter().find_map(|c| c.observation.species())?;
            Some(ObservedTaxon {
                id: taxon_id,
                scientific_name: infraspecific
                    .species_name
                    .clone()
                    .unwrap_or_else(|| infraspecific.scientific_name.clone()),
                ..infraspecific.clone()
            })
        })
        .unwrap_or_else(|| ObservedTaxon {
            id: taxon_id,
            species_level: true,
            ..ObservedTaxon::default()
        });
    let scientific_name = if taxon.scientific_name.is_empty() {
        taxon_id.to_string()
    } else {
        taxon.scientific_name.clone()
    };

    let mut observers: Vec<String> = Vec::new();
    let mut research_grade_observers: Vec<String> = Vec::new();
    for c in observations {
        let login = &c.observation.observer;
        if !observers.contains(login) {
            observers.push(login.clone());
        }
        if c.observation.quality_grade.is_research() && !research_grade_observers.contains(login) {
            research_grade_observers.push(login.clone());
        }
    }

    let scopes: Vec<SpeciesScopeStatus> = run
        .scopes
        .iter()
        .map(|scope| {
            let mut status = SpeciesScopeStatus {
                scope_key: scope.key.clone(),
                first: None,
                notable: false,
                scope_count: None,
            };
            for c in observations {
                if let Some(classification) = c.scope(&scope.key) {
                    if classification.is_first() && status.first.is_none() {
                        status.first = Some(c.observation.id);
                    }
                    status.notable |= classification.is_notable();
                    if status.scope_count.is_none() {
                        status.scope_count = classification.observation_count();
                    }
                }
            }
            status
        })
        .collect();

    let highest_first_text = run
        .scopes
        .iter()
        .zip(&scopes)
        .rev()
        .find(|(_, status)| status.first.is_some())
        .map(|(scope, _)| scope.first_text.clone());

    let unique_to = match (observers.len(), research_grade_observers.len()) {
        (1, _) => observers.first().cloned(),
        (_, 1) => research_grade_observers.first().cloned(),
        _ => None,
    };

    SpeciesSummary {
        taxon_id,
        scientific_name,
        taxon,
        observers,
        research_grade_observers,
        project_count: observations.len(),
        scopes,
        highest_first_text,
        unique_to,
    }
}

fn scope_section(
    run: &ClassificationRun,
    species: &[SpeciesSummary],
    index: usize,
    scope: &Scope,
    rank: &dyn Fn(TaxonId) -> usize,
) -> ScopeSection {
    let mut firsts = Vec::new();
    let mut notables = Vec::new();

    for summary in species {
        let Some(status) = summary.scopes.get(index) else {
            continue;
        };
        if let Some(observation_id) = status.first {
            if let Some(c) = run.classified.iter().find(|c| c.observation.id == observation_id) {
                firsts.push(FirstEntry {
                    taxon_id: summary.taxon_id,
                    observation_id,
                    observer: c.observation.observer.clone(),
                    research_grade: c.observation.quality_grade.is_research(),
                    url: c.observation.url.clone(),
                    thumbnail_url: c.observation.thumbnail_url(),
                });
            }
        } else if status.notable {
            notables.push(NotableEntry {
                taxon_id: summary.taxon_id,
                scope_count: status.scope_count.unwrap_or(0),
            });
        }
    }

    // `species` is already alphabetical, so firsts are too
    notables.sort_by(|a, b| {
        a.scope_count
            .cmp(&b.scope_count)
            .then(rank(a.taxon_id).cmp(&rank(b.taxon_id)))
    });

    let unknown = run
        .classified
        .iter()
        .filter(|c| c.scope(&scope.key).map_or(false, |s| s.is_unknown()))
        .count();

    ScopeSection {
        scope: scope.clone(),
        firsts,
        notables,
        unknown,
    }
}

fn observer_sections(
    run: &ClassificationRun,
    species: &[SpeciesSummary],
    rank: &dyn Fn(TaxonId) -> usize,
) -> Vec<ObserverSection> {
    let mut sections: Vec<ObserverSection> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for c in &run.classified {
        let taxon_id = c.species_id;
        let login = c.observation.observer.as_str();
        let position = *index.entry(login).or_insert_with(|| {
            sections.push(ObserverSection {
                login: login.to_string(),
                observations: Vec::new(),
                unique_species: Vec::new(),
            });
            sections.len() - 1
        });

        sections[position].observations.push(ObserverEntry {
            observation_id: c.observation.id,
            taxon_id,
            first_in: c
                .scopes
                .iter()
                .filter(|s| s.is_first())
                .map(|s| s.scope_key.clone())
                .collect(),
            notable_in: c
                .scopes
                .iter()
                .filter(|s| s.is_notable())
                .map(|s| s.scope_key.clone())
                .collect(),
        });
    }

    for summary in species {
        let Some(login) = summary.unique_to.as_deref() else {
            continue;
        };
        if let Some(&position) = index.get(login) {
            sections[position].unique_species.push(UniqueSpecies {
                taxon_id: summary.taxon_id,
                has_research_grade: summary.has_research_grade_from(login),
                other_observers: summary.observers.len() - 1,
            });
        }
    }
    for section in &mut sections {
        section.unique_species.sort_by_key(|u| rank(u.taxon_id));
    }

    sections
}

/// Priority observations of an export, in taxonomic order
///
/// Rows not identified to species, not research grade, whose genus has no
/// species-level row anywhere in the export. Repeated ids keep their first row.
pub fn priority_observations(observations: &[Observation]) -> Vec<PriorityObservation> {
    let mut seen: HashSet<ObservationId> = HashSet::new();
    let rows: Vec<&Observation> = observations.iter().filter(|o| seen.insert(o.id)).collect();

    let genera_with_species: HashSet<&str> = rows
        .iter()
        .filter_map(|o| o.species())
        .filter_map(|t| t.lineage.genus.as_deref())
        .collect();

    let mut priority: Vec<PriorityObservation> = rows
        .into_iter()
        .filter(|o| o.quality_grade != QualityGrade::Research)
        .filter_map(|o| {
            let taxon = o.taxon.as_ref().filter(|t| !t.species_level)?;
            let genus = taxon.lineage.genus.as_deref()?;
            if genera_with_species.contains(genus) {
                return None;
            }
            Some(PriorityObservation {
                observation_id: o.id,
                observer: o.observer.clone(),
                taxon_name: taxon.scientific_name.clone(),
                lineage: taxon.lineage.clone(),
                url: o.url.clone(),
                image_url: o.image_url.clone(),
            })
        })
        .collect();

    // Stable: export order within a genus
    priority.sort_by(|a, b| a.lineage.taxonomic_cmp(&b.lineage));
    priority
}
