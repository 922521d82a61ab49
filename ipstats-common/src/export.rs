//! iNaturalist observation export reader
//!
//! Parses the CSV produced by https://www.inaturalist.org/observations/export.
//! The `taxon_species_name` column must be selected in the export; without it
//! no observation can be recognised as species level.

use crate::error::{Error, Result};
use crate::observation::{Coordinates, Lineage, Observation, ObservedTaxon, QualityGrade};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Raw export row; every column is optional so partial exports still load
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportRow {
    id: Option<String>,
    user_login: Option<String>,
    taxon_id: Option<String>,
    taxon_species_name: Option<String>,
    taxon_kingdom_name: Option<String>,
    taxon_class_name: Option<String>,
    taxon_order_name: Option<String>,
    taxon_family_name: Option<String>,
    taxon_genus_name: Option<String>,
    scientific_name: Option<String>,
    common_name: Option<String>,
    species_guess: Option<String>,
    time_observed_at: Option<String>,
    observed_on: Option<String>,
    quality_grade: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    url: Option<String>,
    image_url: Option<String>,
}

/// Read an export file from disk
pub fn read_export(path: &Path) -> Result<Vec<Observation>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Export(format!("cannot open {}: {}", path.display(), e)))?;
    let observations = parse_export(file)?;

    info!(
        path = %path.display(),
        rows = observations.len(),
        "Loaded observation export"
    );

    Ok(observations)
}

/// Parse export CSV from any reader, preserving row order
pub fn parse_export<R: Read>(reader: R) -> Result<Vec<Observation>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut observations = Vec::new();
    for (index, row) in csv_reader.deserialize::<ExportRow>().enumerate() {
        // Header is line 1
        let line = index + 2;
        let row = row.map_err(|e| Error::Export(format!("line {}: {}", line, e)))?;
        observations.push(row_to_observation(row, line)?);
    }

    Ok(observations)
}

fn row_to_observation(row: ExportRow, line: usize) -> Result<Observation> {
    let id = non_empty(row.id)
        .and_then(|raw| parse_integer(&raw))
        .ok_or_else(|| Error::Export(format!("line {}: missing or invalid observation id", line)))?;

    let observer = non_empty(row.user_login).unwrap_or_default();

    let species_name = non_empty(row.taxon_species_name);
    let lineage = Lineage {
        kingdom: non_empty(row.taxon_kingdom_name),
        class: non_empty(row.taxon_class_name),
        order: non_empty(row.taxon_order_name),
        family: non_empty(row.taxon_family_name),
        genus: non_empty(row.taxon_genus_name),
    };
    let taxon = non_empty(row.taxon_id)
        .and_then(|raw| parse_integer(&raw))
        .map(|taxon_id| ObservedTaxon {
            id: taxon_id,
            scientific_name: non_empty(row.scientific_name)
                .or_else(|| species_name.clone())
                .unwrap_or_else(|| taxon_id.to_string()),
            common_name: non_empty(row.common_name),
            species_guess: non_empty(row.species_guess),
            species_level: species_name.is_some(),
            species_name,
            lineage,
        });

    let observed_at = non_empty(row.time_observed_at)
        .and_then(|raw| parse_timestamp(&raw))
        .or_else(|| non_empty(row.observed_on).and_then(|raw| parse_date(&raw)));

    if observed_at.is_none() {
        debug!(observation_id = id, line, "Observation has no usable timestamp");
    }

    let coordinates = match (
        non_empty(row.latitude).and_then(|v| v.parse::<f64>().ok()),
        non_empty(row.longitude).and_then(|v| v.parse::<f64>().ok()),
    ) {
        (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
        _ => None,
    };

    Ok(Observation {
        id,
        observer,
        taxon,
        observed_at,
        quality_grade: QualityGrade::from_export(row.quality_grade.as_deref()),
        coordinates,
        url: non_empty(row.url),
        image_url: non_empty(row.image_url),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Integer column, tolerating the `123.0` form some spreadsheet tools write
fn parse_integer(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= u64::MAX as f64)
            .map(|v| v as u64)
    })
}

/// Parse the timestamp formats found in exports and API responses
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(naive) = raw.strip_suffix(" UTC") {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S") {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    None
}

/// Midnight UTC of an `observed_on` date
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ts| Utc.from_utc_datetime(&ts))
}
