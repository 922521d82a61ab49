//! Classifier scenarios against an in-memory occurrence source

use chrono::{DateTime, TimeZone, Utc};
use ipstats_common::{Observation, ObservedTaxon, QualityGrade, Scope, ScopeHierarchy, ScopeId};
use ipstats_notable::aggregate;
use ipstats_notable::classifier::{classify, ClassifyError, ClassifyOptions, ScopeOutcome};
use ipstats_notable::oracle::{MemorySource, OccurrenceCache, OccurrenceOracle, OracleError, TaxonRecord};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CITY: u64 = 6744;
const COUNTRY: u64 = 8057;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, day, hour, 0, 0).unwrap()
}

fn observation(id: u64, observer: &str, taxon: u64, observed_at: DateTime<Utc>) -> Observation {
    Observation {
        id,
        observer: observer.to_string(),
        taxon: Some(ObservedTaxon {
            id: taxon,
            scientific_name: format!("Taxon {}", taxon),
            common_name: None,
            species_guess: None,
            species_level: true,
            ..ObservedTaxon::default()
        }),
        observed_at: Some(observed_at),
        quality_grade: QualityGrade::Research,
        coordinates: None,
        url: None,
        image_url: None,
    }
}

fn three_scopes() -> ScopeHierarchy {
    ScopeHierarchy::validate(vec![
        Scope::new(ScopeId::Places(vec![CITY]), "Vienna", 5).with_key("city"),
        Scope::new(ScopeId::Places(vec![COUNTRY]), "Austria", 5).with_key("country"),
        Scope::new(ScopeId::Global, "Global", 5),
    ])
    .unwrap()
}

async fn run(
    source: MemorySource,
    observations: &[Observation],
    scopes: &ScopeHierarchy,
) -> (ipstats_notable::ClassificationRun, OccurrenceOracle<MemorySource>) {
    let oracle = OccurrenceOracle::new(source);
    let run = classify(
        observations,
        scopes,
        &oracle,
        &OccurrenceCache::new(),
        &ClassifyOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    (run, oracle)
}

#[tokio::test]
async fn test_earliest_in_city_but_not_in_country() {
    let ours = observation(100, "amy", 7, at(10, 9));
    let source = MemorySource::new()
        .with_records(7, ScopeId::Places(vec![CITY]), vec![(100, at(10, 9)), (120, at(12, 9))])
        .with_records(
            7,
            ScopeId::Places(vec![COUNTRY]),
            vec![(100, at(10, 9)), (50, at(1, 9)), (120, at(12, 9))],
        )
        .with_records(
            7,
            ScopeId::Global,
            (1..=40).map(|i| (i, at(1, 0))).chain([(100, at(10, 9))]).collect(),
        );

    let (run, _) = run(source, &[ours], &three_scopes()).await;
    let classified = &run.classified[0];

    assert!(classified.scope("city").unwrap().is_first());
    assert!(classified.scope("city").unwrap().is_notable());
    assert!(!classified.scope("country").unwrap().is_first());
    assert!(classified.scope("country").unwrap().is_notable());
    assert!(!classified.scope("global").unwrap().is_first());
    assert!(!classified.scope("global").unwrap().is_notable());
    assert_eq!(classified.scope("global").unwrap().observation_count(), Some(41));
}

#[tokio::test]
async fn test_tied_timestamp_lower_id_is_first() {
    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 5)]).unwrap();
    let source = MemorySource::new().with_records(7, ScopeId::Global, vec![(42, at(3, 8)), (17, at(3, 8))]);
    let observations = vec![
        observation(42, "amy", 7, at(3, 8)),
        observation(17, "bob", 7, at(3, 8)),
    ];

    let (run, _) = run(source, &observations, &scopes).await;

    assert!(!run.classified[0].scopes[0].is_first());
    assert!(run.classified[1].scopes[0].is_first());
}

#[tokio::test]
async fn test_external_tie_with_lower_id_wins() {
    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 5)]).unwrap();
    // Someone outside the project observed it at the same moment, with a lower id
    let source = MemorySource::new().with_records(7, ScopeId::Global, vec![(900, at(5, 12)), (899, at(5, 12))]);

    let (run, _) = run(source, &[observation(900, "amy", 7, at(5, 12))], &scopes).await;

    let global = &run.classified[0].scopes[0];
    assert!(!global.is_first());
    assert!(global.is_notable());
}

#[tokio::test]
async fn test_upstream_failure_only_affects_that_scope() {
    let source = MemorySource::new()
        .with_records(7, ScopeId::Places(vec![CITY]), vec![(1, at(1, 1))])
        .failing(7, ScopeId::Places(vec![COUNTRY]))
        .with_records(7, ScopeId::Global, vec![(1, at(1, 1))]);

    let (run, _) = run(source, &[observation(1, "amy", 7, at(1, 1))], &three_scopes()).await;
    let classified = &run.classified[0];

    assert!(classified.scope("city").unwrap().is_first());
    assert!(classified.scope("global").unwrap().is_first());

    let country = classified.scope("country").unwrap();
    assert!(matches!(
        country.outcome,
        ScopeOutcome::Unknown(OracleError::UpstreamUnavailable(_))
    ));
    assert!(!country.is_first());
    assert!(!country.is_notable());
    assert_eq!(country.first_text, None);
}

#[tokio::test]
async fn test_ambiguous_taxon_is_unknown_everywhere() {
    let source = MemorySource::new()
        .with_taxon(TaxonRecord {
            id: 7,
            name: "Bombus".to_string(),
            rank: "genus".to_string(),
            is_active: true,
            preferred_common_name: None,
            species_ancestor: None,
        })
        .with_records(7, ScopeId::Global, vec![(1, at(1, 1))]);

    let (run, oracle) = run(source, &[observation(1, "amy", 7, at(1, 1))], &three_scopes()).await;

    for scope in &run.classified[0].scopes {
        assert!(matches!(
            &scope.outcome,
            ScopeOutcome::Unknown(OracleError::AmbiguousTaxon { taxon_id: 7, rank }) if rank == "genus"
        ));
    }
    assert_eq!(oracle.source().occurrence_calls(), 0);
}

#[tokio::test]
async fn test_subspecies_row_counts_as_its_species() {
    let city = vec![(1, at(2, 9)), (2, at(1, 9))];
    let source = MemorySource::new()
        .with_taxon(TaxonRecord::infraspecific(55, "Pica pica pica", "subspecies", 5))
        .with_records(5, ScopeId::Places(vec![CITY]), city.clone())
        .with_records(5, ScopeId::Places(vec![COUNTRY]), city.clone())
        .with_records(5, ScopeId::Global, city.into_iter().chain([(900, at(3, 1))]).collect());

    let mut subspecies = observation(2, "bob", 55, at(1, 9));
    if let Some(taxon) = subspecies.taxon.as_mut() {
        taxon.scientific_name = "Pica pica pica".to_string();
        taxon.species_name = Some("Pica pica".to_string());
    }
    let observations = vec![observation(1, "amy", 5, at(2, 9)), subspecies];

    let (run, oracle) = run(source, &observations, &three_scopes()).await;

    let bob = &run.classified[1];
    assert_eq!(bob.species_id, 5);
    assert!(bob.scopes.iter().all(|s| s.is_first()));
    assert!(run.classified[0].scopes.iter().all(|s| !s.is_first() && !s.is_unknown()));
    // Species and subspecies share one lookup per scope
    assert_eq!(oracle.source().occurrence_calls(), 3);

    let report = aggregate(&run);
    assert_eq!(report.species.len(), 1);
    let species = report.species(5).unwrap();
    assert_eq!(species.project_count, 2);
    assert_eq!(species.scope("city").unwrap().first, Some(2));
    assert!(report.scopes.iter().all(|s| s.unknown == 0));
}

#[tokio::test]
async fn test_notability_is_independent_of_first() {
    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 0)]).unwrap();
    let source = MemorySource::new().with_records(7, ScopeId::Global, vec![(1, at(1, 1))]);

    let (run, _) = run(source, &[observation(1, "amy", 7, at(1, 1))], &scopes).await;
    let global = &run.classified[0].scopes[0];

    // Threshold 0: nothing with an observation can be notable, firsts still count
    assert!(global.is_first());
    assert!(!global.is_notable());
}

#[tokio::test]
async fn test_exclusions_are_tallied_once() {
    let mut genus_only = observation(2, "bob", 8, at(1, 1));
    if let Some(taxon) = genus_only.taxon.as_mut() {
        taxon.species_level = false;
    }
    let mut casual = observation(3, "cat", 9, at(1, 1));
    casual.quality_grade = QualityGrade::Casual;
    let observations = vec![
        observation(1, "amy", 7, at(1, 1)),
        genus_only,
        casual,
        observation(1, "amy", 7, at(1, 1)),
    ];

    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 5)]).unwrap();
    let (run, oracle) = run(MemorySource::new(), &observations, &scopes).await;

    assert_eq!(run.classified.len(), 1);
    assert_eq!(run.excluded.not_species_level, 1);
    assert_eq!(run.excluded.casual, 1);
    assert_eq!(run.excluded.duplicate, 1);
    assert_eq!(run.classified.len() + run.excluded.total(), observations.len());
    // Excluded taxa are never looked up
    assert_eq!(oracle.source().occurrence_calls(), 1);
}

#[tokio::test]
async fn test_one_lookup_per_species_and_scope() {
    let source = MemorySource::new().with_delay(Duration::from_millis(10));
    let observations: Vec<_> = (1..=10)
        .map(|i| observation(i, if i % 2 == 0 { "amy" } else { "bob" }, 7, at(1, i as u32)))
        .collect();

    let oracle = OccurrenceOracle::new(source);
    let cache = OccurrenceCache::new();
    let options = ClassifyOptions {
        workers: 8,
        ..ClassifyOptions::default()
    };
    classify(
        &observations,
        &three_scopes(),
        &oracle,
        &cache,
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(oracle.source().occurrence_calls(), 3);
    // One taxon resolution plus three occurrence queries
    assert_eq!(cache.upstream_queries(), 4);
}

#[tokio::test]
async fn test_rerun_with_same_cache_is_identical() {
    let source = MemorySource::new()
        .with_records(7, ScopeId::Places(vec![CITY]), vec![(1, at(1, 1))])
        .failing(7, ScopeId::Places(vec![COUNTRY]))
        .with_records(7, ScopeId::Global, vec![(1, at(1, 1)), (2, at(2, 1))]);
    let oracle = OccurrenceOracle::new(source);
    let cache = OccurrenceCache::new();
    let observations = vec![observation(1, "amy", 7, at(1, 1)), observation(2, "bob", 7, at(2, 1))];
    let scopes = three_scopes();
    let token = CancellationToken::new();

    let first = classify(&observations, &scopes, &oracle, &cache, &ClassifyOptions::default(), &token)
        .await
        .unwrap();
    let calls = oracle.source().occurrence_calls();
    let second = classify(&observations, &scopes, &oracle, &cache, &ClassifyOptions::default(), &token)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(oracle.source().occurrence_calls(), calls);
}

#[tokio::test]
async fn test_output_order_is_independent_of_worker_count() {
    let mut source = MemorySource::new().with_delay(Duration::from_millis(3));
    let mut observations = Vec::new();
    for taxon in 1..=15u64 {
        source = source.with_records(taxon, ScopeId::Global, vec![(taxon * 10, at(1, 1))]);
        observations.push(observation(taxon * 10, &format!("user{}", taxon % 4), taxon, at(1, 1)));
    }
    let oracle = OccurrenceOracle::new(source);
    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 5)]).unwrap();

    let mut runs = Vec::new();
    for workers in [1, 4, 16] {
        let options = ClassifyOptions {
            workers,
            ..ClassifyOptions::default()
        };
        let run = classify(
            &observations,
            &scopes,
            &oracle,
            &OccurrenceCache::new(),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(oracle.source().max_in_flight() <= 16);
        runs.push(run);
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
    let ids: Vec<_> = runs[0].classified.iter().map(|c| c.observation.id).collect();
    let expected: Vec<_> = observations.iter().map(|o| o.id).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_cancellation_discards_partial_results() {
    let mut source = MemorySource::new().with_delay(Duration::from_millis(40));
    let mut observations = Vec::new();
    for taxon in 1..=10u64 {
        source = source.with_records(taxon, ScopeId::Global, vec![(taxon, at(1, 1))]);
        observations.push(observation(taxon, "amy", taxon, at(1, 1)));
    }
    let oracle = OccurrenceOracle::new(source);
    let scopes = ScopeHierarchy::validate(vec![Scope::new(ScopeId::Global, "Global", 5)]).unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let result = classify(
        &observations,
        &scopes,
        &oracle,
        &OccurrenceCache::new(),
        &ClassifyOptions {
            workers: 1,
            ..ClassifyOptions::default()
        },
        &cancel,
    )
    .await;

    assert!(matches!(result, Err(ClassifyError::Cancelled { total: 10, .. })));
    assert!(oracle.source().occurrence_calls() < 10);
}
