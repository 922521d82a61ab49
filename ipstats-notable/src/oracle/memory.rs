//! In-memory occurrence source
//!
//! Serves fixed occurrence data in pages. Used by tests and for offline dry
//! runs; supports injected failures, artificial latency and call accounting.

use super::{OccurrencePage, OccurrenceSource, PageRecord, SourceError, TaxonRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use ipstats_common::{ScopeId, TaxonId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 200;

pub struct MemorySource {
    taxa: HashMap<TaxonId, TaxonRecord>,
    records: HashMap<(TaxonId, ScopeId), Vec<PageRecord>>,
    failing: HashSet<(TaxonId, ScopeId)>,
    unavailable_taxa: HashSet<TaxonId>,
    page_size: usize,
    sorted: bool,
    delay: Option<Duration>,
    occurrence_calls: AtomicUsize,
    pages_served: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            taxa: HashMap::new(),
            records: HashMap::new(),
            failing: HashSet::new(),
            unavailable_taxa: HashSet::new(),
            page_size: DEFAULT_PAGE_SIZE,
            sorted: false,
            delay: None,
            occurrence_calls: AtomicUsize::new(0),
            pages_served: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Register a taxon; unregistered ids resolve as active species
    pub fn with_taxon(mut self, record: TaxonRecord) -> Self {
        self.taxa.insert(record.id, record);
        self
    }

    /// Add observations of `taxon` within `scope` as (id, timestamp) pairs
    pub fn with_records(
        mut self,
        taxon: TaxonId,
        scope: ScopeId,
        records: Vec<(u64, DateTime<Utc>)>,
    ) -> Self {
        self.records
            .entry((taxon, scope))
            .or_default()
            .extend(records.into_iter().map(|(id, observed_at)| PageRecord {
                id,
                observed_at: Some(observed_at),
            }));
        self
    }

    /// Add an observation without a timestamp
    pub fn with_undated_record(mut self, taxon: TaxonId, scope: ScopeId, id: u64) -> Self {
        self.records
            .entry((taxon, scope))
            .or_default()
            .push(PageRecord { id, observed_at: None });
        self
    }

    /// Make occurrence queries for this key fail
    pub fn failing(mut self, taxon: TaxonId, scope: ScopeId) -> Self {
        self.failing.insert((taxon, scope));
        self
    }

    /// Make taxon resolution for this id fail as unavailable
    pub fn unavailable_taxon(mut self, taxon: TaxonId) -> Self {
        self.unavailable_taxa.insert(taxon);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Serve pages in ascending (timestamp, id) order with floors set
    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    /// Sleep before serving each page
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Occurrence queries started
    pub fn occurrence_calls(&self) -> usize {
        self.occurrence_calls.load(Ordering::SeqCst)
    }

    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    /// Highest number of occurrence queries observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge when a page stream finishes or is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OccurrenceSource for MemorySource {
    async fn resolve_taxon(&self, taxon_id: TaxonId) -> Result<TaxonRecord, SourceError> {
        if self.unavailable_taxa.contains(&taxon_id) {
            return Err(SourceError::Unavailable(format!("taxon {} lookup failed", taxon_id)));
        }
        Ok(self
            .taxa
            .get(&taxon_id)
            .cloned()
            .unwrap_or_else(|| TaxonRecord::species(taxon_id, format!("taxon {}", taxon_id))))
    }

    fn occurrences<'a>(
        &'a self,
        taxon_id: TaxonId,
        scope: &'a ScopeId,
    ) -> BoxStream<'a, Result<OccurrencePage, SourceError>> {
        let key = (taxon_id, scope.clone());
        let fails = self.failing.contains(&key);
        let mut records = self.records.get(&key).cloned().unwrap_or_default();
        if self.sorted {
            records.sort_by_key(|r| (r.observed_at.is_none(), r.observed_at, r.id));
        }
        let total = records.len() as u64;
        let page_size = self.page_size;

        async_stream::stream! {
            self.occurrence_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if fails {
                yield Err(SourceError::Unavailable(format!(
                    "occurrence search for taxon {} in {} failed",
                    taxon_id, scope
                )));
                return;
            }
            if records.is_empty() {
                yield Ok(OccurrencePage { records: Vec::new(), total_results: Some(0), floor: None });
                return;
            }

            for (index, chunk) in records.chunks(page_size).enumerate() {
                if index > 0 {
                    if let Some(delay) = self.delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                let floor = if self.sorted {
                    chunk.last().and_then(|r| r.observed_at)
                } else {
                    None
                };
                self.pages_served.fetch_add(1, Ordering::SeqCst);
                yield Ok(OccurrencePage {
                    records: chunk.to_vec(),
                    total_results: Some(total),
                    floor,
                });
            }
        }
        .boxed()
    }
}
