//! Analysis pipeline
//!
//! load config → validate scopes → resolve place names → read export →
//! classify (bounded, cancellable) → aggregate → write `index.html`,
//! `priority.html` and `species.csv`.
//!
//! Output files are written only after classification has fully succeeded
//! and every output has been rendered; a cancelled or timed-out run leaves
//! the output folder untouched.

use crate::aggregator::{aggregate, priority_observations, PriorityObservation, Report};
use crate::classifier::{classify, ClassifyOptions};
use crate::error::{AnalysisError, Result};
use crate::oracle::{OccurrenceCache, OccurrenceOracle, OccurrenceSource};
use crate::render::{render_html, render_priority_html, write_species_csv, RenderOptions};
use crate::services::{INatClient, INatClientConfig};
use chrono::Utc;
use ipstats_common::config::{AnalysisPaths, ProjectConfig};
use ipstats_common::export::read_export;
use ipstats_common::{ScopeHierarchy, ScopeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line overrides for one analysis run
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub workers: Option<usize>,
    pub timeout_secs: Option<u64>,
}

/// Files written by a successful run
#[derive(Debug)]
pub struct AnalysisOutput {
    pub html_path: PathBuf,
    pub priority_path: PathBuf,
    pub csv_path: PathBuf,
    pub report: Report,
    pub priority: Vec<PriorityObservation>,
}

/// Run a full analysis against the live iNaturalist API
pub async fn run_analysis(
    data_root: &Path,
    analysis: &str,
    overrides: &RunOverrides,
    cancel: &CancellationToken,
) -> Result<AnalysisOutput> {
    let paths = AnalysisPaths::new(data_root, analysis);
    let config = ProjectConfig::load(&paths.config_file()?)?;
    // Structure errors surface before any network request
    config.scope_hierarchy(&HashMap::new())?;

    let client = INatClient::new(INatClientConfig {
        requests_per_minute: config.analysis.requests_per_minute,
        max_retries: config.analysis.max_retries,
        ..INatClientConfig::default()
    })?;

    let names = resolve_place_names(&client, &config).await?;
    let scopes = config.scope_hierarchy(&names)?;

    let oracle = OccurrenceOracle::new(client);
    analyse(&paths, &config, &scopes, &oracle, overrides, cancel).await
}

/// Look up display names for places configured without one
///
/// Lookup failures are logged and leave the place to fall back to its id.
pub async fn resolve_place_names(
    client: &INatClient,
    config: &ProjectConfig,
) -> Result<HashMap<ScopeId, String>> {
    let mut names = HashMap::new();

    for scope_id in config.unnamed_places()? {
        let ScopeId::Places(ids) = &scope_id else {
            continue;
        };
        match client.place_display_name(ids).await {
            Ok(name) => {
                names.insert(scope_id, name);
            }
            Err(e) => warn!(place = %scope_id, error = %e, "Place name lookup failed, using id"),
        }
    }

    Ok(names)
}

/// Classify, aggregate and write outputs for an already-configured analysis
pub async fn analyse<S: OccurrenceSource>(
    paths: &AnalysisPaths,
    config: &ProjectConfig,
    scopes: &ScopeHierarchy,
    oracle: &OccurrenceOracle<S>,
    overrides: &RunOverrides,
    cancel: &CancellationToken,
) -> Result<AnalysisOutput> {
    let observations = read_export(&paths.export_file(config))?;

    let options = ClassifyOptions {
        workers: overrides.workers.unwrap_or(config.analysis.workers).max(1),
        ..ClassifyOptions::default()
    };
    let timeout_secs = overrides.timeout_secs.or(config.analysis.timeout_secs);

    // Child token so a timeout can be told apart from an outside cancel
    let run_token = cancel.child_token();
    let timer = timeout_secs.map(|secs| {
        let token = run_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            token.cancel();
        })
    });

    let cache = OccurrenceCache::new();
    let result = classify(&observations, scopes, oracle, &cache, &options, &run_token).await;
    if let Some(timer) = timer {
        timer.abort();
    }

    let run = match (result, timeout_secs) {
        (Ok(run), _) => run,
        (Err(_), Some(secs)) if !cancel.is_cancelled() => {
            warn!(timeout_secs = secs, "Analysis timed out, no output written");
            return Err(AnalysisError::TimedOut(secs));
        }
        (Err(e), _) => {
            warn!(error = %e, "Analysis cancelled, no output written");
            return Err(e.into());
        }
    };

    let report = aggregate(&run);
    let priority = priority_observations(&observations);
    let render_options = RenderOptions {
        title: config.name.clone(),
        generated_on: Utc::now().date_naive(),
        locale: config.locale.clone(),
        root_header_level: config.root_header_level,
        context_query: config.context_query(),
        link_to_project: config.project.is_some(),
    };

    write_outputs(&paths.output_dir(), report, priority, &render_options)
}

/// Write `index.html`, `priority.html` and `species.csv` into `output_dir`
///
/// Everything is rendered in memory first and staged next to its target, so
/// a failure leaves earlier outputs as they were.
pub fn write_outputs(
    output_dir: &Path,
    report: Report,
    priority: Vec<PriorityObservation>,
    options: &RenderOptions,
) -> Result<AnalysisOutput> {
    let html = render_html(&report, options)?;
    let priority_html = render_priority_html(&priority, options)?;
    let mut csv = Vec::new();
    write_species_csv(&report, &mut csv)?;

    std::fs::create_dir_all(output_dir)?;
    let html_path = output_dir.join("index.html");
    let priority_path = output_dir.join("priority.html");
    let csv_path = output_dir.join("species.csv");
    let outputs = [
        (&html_path, html.into_bytes()),
        (&priority_path, priority_html.into_bytes()),
        (&csv_path, csv),
    ];

    let mut staged: Vec<(std::path::PathBuf, &std::path::PathBuf)> = Vec::with_capacity(outputs.len());
    for (path, content) in &outputs {
        let staging = path.with_extension("tmp");
        if let Err(e) = std::fs::write(&staging, content) {
            for (staging, _) in &staged {
                if let Err(cleanup) = std::fs::remove_file(staging) {
                    warn!(path = %staging.display(), error = %cleanup, "Could not remove staged output");
                }
            }
            return Err(e.into());
        }
        staged.push((staging, *path));
    }
    for (staging, path) in &staged {
        std::fs::rename(staging, path)?;
    }

    info!(
        html = %html_path.display(),
        priority = %priority_path.display(),
        csv = %csv_path.display(),
        species = report.species.len(),
        priority_observations = priority.len(),
        "Report written"
    );

    Ok(AnalysisOutput {
        html_path,
        priority_path,
        csv_path,
        report,
        priority,
    })
}
