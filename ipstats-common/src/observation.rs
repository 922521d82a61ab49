//! Observation model
//!
//! One row of a project export, after parsing. Read once, never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// iNaturalist observation id
pub type ObservationId = u64;

/// iNaturalist taxon id
pub type TaxonId = u64;

/// Observation quality grade as reported in the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Research,
    NeedsId,
    Casual,
}

impl QualityGrade {
    /// Parse the export column value; unknown or missing values count as research
    /// grade, matching exports that only contain research-grade observations
    pub fn from_export(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("needs_id") => QualityGrade::NeedsId,
            Some("casual") => QualityGrade::Casual,
            _ => QualityGrade::Research,
        }
    }

    pub fn is_research(self) -> bool {
        self == QualityGrade::Research
    }
}

/// Higher-rank names of a taxon, as exported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub kingdom: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
}

impl Lineage {
    /// Names from kingdom down to genus
    pub fn ranks(&self) -> [Option<&str>; 5] {
        [
            self.kingdom.as_deref(),
            self.class.as_deref(),
            self.order.as_deref(),
            self.family.as_deref(),
            self.genus.as_deref(),
        ]
    }

    /// Taxonomic order; a missing name sorts after every present one
    pub fn taxonomic_cmp(&self, other: &Self) -> Ordering {
        self.ranks()
            .iter()
            .zip(other.ranks().iter())
            .map(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

/// Taxon an observation is identified as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTaxon {
    pub id: TaxonId,
    pub scientific_name: String,
    /// Common name in the export's language (usually English)
    pub common_name: Option<String>,
    /// Observer's own label, usually in the project locale
    pub species_guess: Option<String>,
    /// Whether the identification reaches species level
    pub species_level: bool,
    /// Name of the species this taxon belongs to; differs from
    /// `scientific_name` for subspecies and varieties
    #[serde(default)]
    pub species_name: Option<String>,
    #[serde(default)]
    pub lineage: Lineage,
}

impl ObservedTaxon {
    /// Best display name for `locale`
    ///
    /// iNaturalist exports carry English common names; `species_guess` tends to be
    /// in the observer's language, so it is preferred for other locales.
    pub fn common_name_for(&self, locale: &str) -> Option<&str> {
        let candidates = if locale == "en" {
            [self.common_name.as_deref(), self.species_guess.as_deref()]
        } else {
            [self.species_guess.as_deref(), self.common_name.as_deref()]
        };

        candidates
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty() && *name != self.scientific_name)
    }
}

/// Observation location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One parsed export row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    /// Observer login
    pub observer: String,
    /// Identification, if the observation has one at all
    pub taxon: Option<ObservedTaxon>,
    /// When the organism was observed
    pub observed_at: Option<DateTime<Utc>>,
    pub quality_grade: QualityGrade,
    /// Carried for completeness; place membership is resolved upstream
    pub coordinates: Option<Coordinates>,
    pub url: Option<String>,
    pub image_url: Option<String>,
}

impl Observation {
    /// Identified to species rank (or finer)
    pub fn is_species_level(&self) -> bool {
        self.taxon.as_ref().is_some_and(|t| t.species_level)
    }

    /// Species-level taxon, if any
    pub fn species(&self) -> Option<&ObservedTaxon> {
        self.taxon.as_ref().filter(|t| t.species_level)
    }

    /// The (timestamp, id) pair compared against upstream records
    pub fn occurrence_record(&self) -> Option<OccurrenceRecord> {
        self.observed_at.map(|observed_at| OccurrenceRecord {
            id: self.id,
            observed_at,
        })
    }

    /// Thumbnail variant of the export's medium image URL
    pub fn thumbnail_url(&self) -> Option<String> {
        self.image_url
            .as_ref()
            .map(|url| url.replace("medium.jpeg", "thumb.jpeg").replace("medium.jpg", "thumb.jpg"))
    }
}

/// One observation as known to the occurrence data source
///
/// Ordered by timestamp, then by id: of two records sharing a timestamp the
/// lower id is the earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub id: ObservationId,
    pub observed_at: DateTime<Utc>,
}

impl Ord for OccurrenceRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.observed_at
            .cmp(&other.observed_at)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for OccurrenceRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
