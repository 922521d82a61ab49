//! Property tests for classification invariants

use chrono::{DateTime, TimeZone, Utc};
use ipstats_common::{Observation, ObservedTaxon, QualityGrade, Scope, ScopeHierarchy, ScopeId};
use ipstats_notable::classifier::{classify, ClassificationRun, ClassifyOptions};
use ipstats_notable::oracle::{MemorySource, OccurrenceCache, OccurrenceOracle};
use proptest::prelude::*;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

const PLACE: u64 = 97394;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
}

/// (taxon, day, hour, inside place)
type Row = (u64, u32, u32, bool);

fn observations(rows: &[Row]) -> Vec<Observation> {
    rows.iter()
        .enumerate()
        .map(|(i, &(taxon, day, hour, _))| Observation {
            id: i as u64 + 1,
            observer: format!("user{}", i % 3),
            taxon: Some(ObservedTaxon {
                id: taxon,
                scientific_name: format!("Taxon {}", taxon),
                common_name: None,
                species_guess: None,
                species_level: true,
                ..ObservedTaxon::default()
            }),
            observed_at: Some(at(day, hour)),
            quality_grade: QualityGrade::Research,
            coordinates: None,
            url: None,
            image_url: None,
        })
        .collect()
}

/// Upstream holds every project observation plus outside records
fn source(rows: &[Row], external: &[Row]) -> MemorySource {
    let mut place: HashMap<u64, Vec<(u64, DateTime<Utc>)>> = HashMap::new();
    let mut global: HashMap<u64, Vec<(u64, DateTime<Utc>)>> = HashMap::new();

    let project = rows.iter().enumerate().map(|(i, r)| (i as u64 + 1, r));
    let outside = external.iter().enumerate().map(|(i, r)| (i as u64 + 1000, r));
    for (id, &(taxon, day, hour, inside)) in project.chain(outside) {
        global.entry(taxon).or_default().push((id, at(day, hour)));
        if inside {
            place.entry(taxon).or_default().push((id, at(day, hour)));
        }
    }

    let mut source = MemorySource::new().with_page_size(3);
    for (taxon, records) in place {
        source = source.with_records(taxon, ScopeId::Places(vec![PLACE]), records);
    }
    for (taxon, records) in global {
        source = source.with_records(taxon, ScopeId::Global, records);
    }
    source
}

fn hierarchy(threshold: i64) -> ScopeHierarchy {
    ScopeHierarchy::validate(vec![
        Scope::new(ScopeId::Places(vec![PLACE]), "Park", threshold).with_key("park"),
        Scope::new(ScopeId::Global, "Global", threshold),
    ])
    .unwrap()
}

fn classify_blocking(source: MemorySource, observations: &[Observation], scopes: &ScopeHierarchy) -> ClassificationRun {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let oracle = OccurrenceOracle::new(source);
        classify(
            observations,
            scopes,
            &oracle,
            &OccurrenceCache::new(),
            &ClassifyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    })
}

fn row() -> impl Strategy<Value = Row> {
    (1u64..5, 1u32..6, 0u32..3, any::<bool>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_at_most_one_first_per_species_and_scope(
        rows in prop::collection::vec(row(), 1..25),
        external in prop::collection::vec(row(), 0..15),
    ) {
        let observations = observations(&rows);
        let run = classify_blocking(source(&rows, &external), &observations, &hierarchy(5));

        let mut firsts: HashMap<(u64, String), usize> = HashMap::new();
        for classified in &run.classified {
            for scope in classified.scopes.iter().filter(|s| s.is_first()) {
                *firsts.entry((classified.species_id, scope.scope_key.clone())).or_default() += 1;
            }
        }
        prop_assert!(firsts.values().all(|&n| n == 1));
    }

    #[test]
    fn test_first_is_the_minimum_record(
        rows in prop::collection::vec(row(), 1..25),
        external in prop::collection::vec(row(), 0..15),
    ) {
        let observations = observations(&rows);
        let run = classify_blocking(source(&rows, &external), &observations, &hierarchy(5));

        for classified in &run.classified {
            let global = classified.scope("global").unwrap();
            let taxon = classified.species_id;
            let own = (classified.observation.observed_at.unwrap(), classified.observation.id);

            let earliest_external = external
                .iter()
                .enumerate()
                .filter(|(_, r)| r.0 == taxon)
                .map(|(i, r)| (at(r.1, r.2), i as u64 + 1000))
                .min();
            let earliest_project = observations
                .iter()
                .filter(|o| o.species().map(|t| t.id) == Some(taxon))
                .map(|o| (o.observed_at.unwrap(), o.id))
                .min();
            let earliest = earliest_external.into_iter().chain(earliest_project).min();

            prop_assert_eq!(global.is_first(), earliest == Some(own));
        }
    }

    #[test]
    fn test_raising_the_threshold_never_removes_notability(
        rows in prop::collection::vec(row(), 1..20),
        external in prop::collection::vec(row(), 0..20),
        low in 0i64..6,
        raise in 0i64..6,
    ) {
        let observations = observations(&rows);
        let strict = classify_blocking(source(&rows, &external), &observations, &hierarchy(low));
        let relaxed = classify_blocking(source(&rows, &external), &observations, &hierarchy(low + raise));

        for (a, b) in strict.classified.iter().zip(&relaxed.classified) {
            for (sa, sb) in a.scopes.iter().zip(&b.scopes) {
                prop_assert!(!sa.is_notable() || sb.is_notable());
                // Firsts do not depend on thresholds
                prop_assert_eq!(sa.is_first(), sb.is_first());
            }
        }
    }
}
