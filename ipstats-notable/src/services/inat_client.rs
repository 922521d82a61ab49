//! iNaturalist API client
//!
//! Rate-limited, retrying client for the public iNaturalist API v1. Implements
//! [`OccurrenceSource`] by streaming `/observations` result pages sorted by
//! observation date, so the oracle can stop reading once the earliest record
//! is settled.
//!
//! API Documentation: https://api.inaturalist.org/v1/docs/

use crate::oracle::{OccurrencePage, OccurrenceSource, PageRecord, SourceError, TaxonRecord};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use futures::stream::{BoxStream, StreamExt};
use governor::{Quota, RateLimiter};
use ipstats_common::export::{parse_date, parse_timestamp};
use ipstats_common::{ScopeId, TaxonId};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const INATURALIST_BASE_URL: &str = "https://api.inaturalist.org/v1";
const USER_AGENT: &str = concat!("ipstats/", env!("CARGO_PKG_VERSION"));

/// Largest result window the API serves (`page * per_page`)
const MAX_RESULT_WINDOW: u64 = 10_000;

/// iNaturalist client errors
#[derive(Debug, Error)]
pub enum INatError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Client setup failed: {0}")]
    ClientSetup(String),
}

impl INatError {
    /// Transient failures worth another attempt
    fn is_retryable(&self) -> bool {
        match self {
            INatError::NetworkError(_) | INatError::RateLimitExceeded => true,
            INatError::ApiError(status, _) => *status >= 500,
            _ => false,
        }
    }
}

impl From<INatError> for SourceError {
    fn from(err: INatError) -> Self {
        match err {
            INatError::NotFound(what) => SourceError::NotFound(what),
            INatError::ParseError(msg) => SourceError::InvalidResponse(msg),
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Envelope shared by all v1 list endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub total_results: u64,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct INatObservation {
    pub id: u64,
    /// UTC timestamp, absent when only a date was recorded
    #[serde(default)]
    pub time_observed_at: Option<String>,
    /// Local observation date (YYYY-MM-DD)
    #[serde(default)]
    pub observed_on: Option<String>,
}

impl INatObservation {
    fn observed_on_date(&self) -> Option<NaiveDate> {
        self.observed_on
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    }

    fn to_page_record(&self) -> PageRecord {
        let observed_at = self
            .time_observed_at
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.observed_on.as_deref().and_then(parse_date));
        PageRecord {
            id: self.id,
            observed_at,
        }
    }
}

/// Rank level of `species`; infraspecific ranks sit below it
const SPECIES_RANK_LEVEL: f64 = 10.0;

#[derive(Debug, Clone, Deserialize)]
pub struct INatTaxon {
    pub id: u64,
    pub name: String,
    pub rank: String,
    #[serde(default)]
    pub rank_level: Option<f64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub preferred_common_name: Option<String>,
    /// Lineage ids from the root down to this taxon
    #[serde(default)]
    pub ancestor_ids: Vec<u64>,
    #[serde(default)]
    pub ancestors: Vec<INatAncestor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct INatAncestor {
    pub id: u64,
    pub rank: String,
}

impl INatTaxon {
    /// Species-rank ancestor of an infraspecific taxon
    pub fn species_ancestor(&self) -> Option<TaxonId> {
        let infraspecific = self.rank_level.is_some_and(|level| level < SPECIES_RANK_LEVEL);
        if !infraspecific {
            return None;
        }
        self.ancestors
            .iter()
            .filter(|a| a.rank == "species")
            .map(|a| a.id)
            .find(|id| self.ancestor_ids.is_empty() || self.ancestor_ids.contains(id))
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct INatPlace {
    pub id: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Convert an `/observations` page sorted by `observed_on` ascending
///
/// Later pages only hold records observed on or after the last record's local
/// date. Local dates can run up to a day ahead of UTC, so the floor is
/// midnight UTC of the day before.
pub fn page_from_response(response: &ApiResponse<INatObservation>) -> OccurrencePage {
    let records = response.results.iter().map(INatObservation::to_page_record).collect();

    let floor = response
        .results
        .last()
        .and_then(INatObservation::observed_on_date)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight) - ChronoDuration::days(1));

    OccurrencePage {
        records,
        total_results: Some(response.total_results),
        floor,
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client settings
#[derive(Debug, Clone)]
pub struct INatClientConfig {
    pub base_url: String,
    pub requests_per_minute: u32,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub per_page: u32,
}

impl Default for INatClientConfig {
    fn default() -> Self {
        Self {
            base_url: INATURALIST_BASE_URL.to_string(),
            requests_per_minute: 60,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(15),
            per_page: 200,
        }
    }
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// iNaturalist API client
pub struct INatClient {
    client: Client,
    config: INatClientConfig,
    rate_limiter: DirectRateLimiter,
}

impl INatClient {
    pub fn new(config: INatClientConfig) -> Result<Self, INatError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| INatError::ClientSetup(e.to_string()))?;

        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        // No bursting: requests are spread evenly across the minute
        let rate_limiter =
            RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(NonZeroU32::MIN));

        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &INatClientConfig {
        &self.config
    }

    /// GET a JSON document, retrying transient failures with backoff
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, INatError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut attempt = 0u32;

        loop {
            match self.get_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "iNaturalist request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, INatError> {
        self.rate_limiter.until_ready().await;

        debug!(url = %url, ?query, "Querying iNaturalist API");

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| INatError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(INatError::NotFound(url.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(INatError::RateLimitExceeded);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(INatError::ApiError(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| INatError::ParseError(e.to_string()))
    }

    /// Look up a taxon by id
    pub async fn taxon(&self, taxon_id: TaxonId) -> Result<INatTaxon, INatError> {
        let response: ApiResponse<INatTaxon> =
            self.get_json(&format!("/taxa/{}", taxon_id), &[]).await?;
        response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| INatError::NotFound(format!("taxon {}", taxon_id)))
    }

    /// Display name for a set of places, joined with ", "
    pub async fn place_display_name(&self, place_ids: &[u64]) -> Result<String, INatError> {
        let ids = place_ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let response: ApiResponse<INatPlace> = self.get_json(&format!("/places/{}", ids), &[]).await?;

        let names: Vec<String> = response
            .results
            .into_iter()
            .filter_map(|place| place.display_name.or(place.name))
            .collect();

        if names.is_empty() {
            return Err(INatError::NotFound(format!("places {}", ids)));
        }

        info!(places = %ids, name = %names.join(", "), "Resolved place name");
        Ok(names.join(", "))
    }

    fn observation_query(&self, taxon_id: TaxonId, scope: &ScopeId, page: u64) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("taxon_id", taxon_id.to_string()),
            ("order_by", "observed_on".to_string()),
            ("order", "asc".to_string()),
            ("per_page", self.config.per_page.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(place_ids) = scope.query_value() {
            query.push(("place_id", place_ids));
        }
        query
    }
}

#[async_trait]
impl OccurrenceSource for INatClient {
    async fn resolve_taxon(&self, taxon_id: TaxonId) -> Result<TaxonRecord, SourceError> {
        let taxon = self.taxon(taxon_id).await?;
        let species_ancestor = taxon.species_ancestor();
        Ok(TaxonRecord {
            id: taxon.id,
            name: taxon.name,
            rank: taxon.rank,
            is_active: taxon.is_active,
            preferred_common_name: taxon.preferred_common_name,
            species_ancestor,
        })
    }

    fn occurrences<'a>(
        &'a self,
        taxon_id: TaxonId,
        scope: &'a ScopeId,
    ) -> BoxStream<'a, Result<OccurrencePage, SourceError>> {
        async_stream::try_stream! {
            let per_page = u64::from(self.config.per_page.max(1));
            let mut page_number = 1u64;
            let mut received = 0u64;

            loop {
                let query = self.observation_query(taxon_id, scope, page_number);
                let response: ApiResponse<INatObservation> = self
                    .get_json("/observations", &query)
                    .await
                    .map_err(SourceError::from)?;

                let page_len = response.results.len() as u64;
                received += page_len;
                let total = response.total_results;
                yield page_from_response(&response);

                if page_len == 0 || received >= total {
                    break;
                }
                if (page_number + 1) * per_page > MAX_RESULT_WINDOW {
                    warn!(
                        taxon_id,
                        scope = %scope,
                        total,
                        received,
                        "Result window exhausted; count taken from reported total"
                    );
                    break;
                }
                page_number += 1;
            }
        }
        .boxed()
    }
}
