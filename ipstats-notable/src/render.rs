//! Report outputs
//!
//! `index.html` (self-contained page with per-scope first/notable lists and
//! per-observer firsts, notables and unique taxa), `priority.html` and
//! `species.csv` (one row per species).

use crate::aggregator::{ObserverSection, PriorityObservation, Report, ScopeSection, SpeciesSummary};
use chrono::NaiveDate;
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use std::fmt::{self, Write as _};
use std::io::Write;

const INAT_WEB: &str = "https://www.inaturalist.org";

const STYLES: &str = r#"<style>
body { font-family: Whitney, "Trebuchet MS", Arial, sans-serif; }
.observations-container { display: flex; flex-wrap: wrap; list-style: none; }
.observation { margin: 0 0.5em 0.5em 0; padding: 0.5em; background-color: #f1f1f1; max-width: 12em; text-align: center; }
.observation .name { display: block; margin-bottom: 0.5em; }
.observation img { display: block; height: 10em; max-width: 100%; margin: 0 auto; }
.unknown { color: #8a4b00; }
</style>"#;

const FILTER_SCRIPT: &str = r#"<script>
(function () {
    var input = document.querySelector('.filter-observations input');
    input.addEventListener('keyup', function () {
        document.querySelectorAll('.filterable').forEach(function (el) {
            el.style.display = el.innerText.search(input.value) != -1 ? '' : 'none';
        });
    });
}());
</script>"#;

/// Presentation settings
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub title: String,
    pub generated_on: NaiveDate,
    /// Locale for common names
    pub locale: String,
    /// Level of the page heading; clamped to 1..=4
    pub root_header_level: u8,
    /// Query string appended to observer links, e.g. `project_id=foo`
    pub context_query: String,
    /// Link taxa to project observations instead of taxon pages
    pub link_to_project: bool,
}

impl RenderOptions {
    pub fn new(title: impl Into<String>, generated_on: NaiveDate) -> Self {
        Self {
            title: title.into(),
            generated_on,
            locale: "en".to_string(),
            root_header_level: 1,
            context_query: String::new(),
            link_to_project: false,
        }
    }

    fn level(&self, offset: u8) -> u8 {
        (self.root_header_level.clamp(1, 4) + offset).min(6)
    }
}

/// Display name: italic scientific name with the common name in parentheses
fn species_name(species: &SpeciesSummary, locale: &str) -> String {
    match species.taxon.common_name_for(locale) {
        Some(common) => format!(
            "<i>{}</i> ({})",
            text(&species.scientific_name),
            text(common)
        ),
        None => format!("<i>{}</i>", text(&species.scientific_name)),
    }
}

fn bold_if(content: String, bold: bool) -> String {
    if bold {
        format!("<b>{}</b>", content)
    } else {
        content
    }
}

fn with_query(base: String, query: &str) -> String {
    if query.is_empty() {
        base
    } else {
        format!("{}&{}", base, query)
    }
}

/// Render the HTML report
pub fn render_html(report: &Report, options: &RenderOptions) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let h1 = options.level(0);
    let h2 = options.level(1);

    writeln!(out, "<!DOCTYPE html>\n<meta charset=\"utf-8\" />")?;
    writeln!(out, "<title>{}</title>\n{}", text(&options.title), STYLES)?;
    writeln!(out, "<h{h1}>{}</h{h1}>", text(&options.title))?;
    writeln!(out, "<p>Last updated: {}</p>", options.generated_on.format("%Y-%m-%d"))?;
    writeln!(
        out,
        "<p>Species in <b>bold</b> have one or more research-grade observations by the listed observer. \
         A number in parentheses after a uniquely observed species counts the other people whose \
         observations of it still need ID.</p>"
    )?;

    write_toc(&mut out, report, h2)?;
    writeln!(
        out,
        "<div class=\"filter-observations\"><label>Search: <input type=\"text\" /></label></div>\n{}",
        FILTER_SCRIPT
    )?;

    writeln!(out, "<h{h2} id=\"notable-species\">Notable Species</h{h2}>")?;
    for section in &report.scopes {
        write_scope(&mut out, report, section, options)?;
    }

    write_observers(&mut out, report, options)?;
    write_footer(&mut out, report, h2)?;
    Ok(out)
}

fn write_toc(out: &mut String, report: &Report, h2: u8) -> fmt::Result {
    writeln!(out, "<h{h2}>Table of Contents</h{h2}>\n<ol>")?;
    writeln!(out, "<li><a href=\"#notable-species\">Notable Species</a>\n<ol>")?;
    for section in &report.scopes {
        let key = attr(&section.scope.key);
        writeln!(
            out,
            "<li><a href=\"#{key}\">{}</a><ol>\
             <li><a href=\"#{key}-firsts\">First Observations</a></li>\
             <li><a href=\"#{key}-notable\">Notable Observations</a></li></ol></li>",
            text(&section.scope.name)
        )?;
    }
    writeln!(out, "</ol></li>")?;
    writeln!(out, "<li><a href=\"#observers\">Observers</a></li>")?;
    writeln!(out, "<li><a href=\"#about\">About this report</a></li>\n</ol>")
}

fn write_scope(out: &mut String, report: &Report, section: &ScopeSection, options: &RenderOptions) -> fmt::Result {
    let h3 = options.level(2);
    let h4 = options.level(3);
    let key = attr(&section.scope.key);

    writeln!(
        out,
        "<h{h3} id=\"{key}\"><a href=\"#{key}\">{}</a></h{h3}>",
        text(&section.scope.name)
    )?;
    if section.unknown > 0 {
        writeln!(
            out,
            "<p class=\"unknown\">{} observations could not be classified for this place because \
             occurrence data was unavailable.</p>",
            section.unknown
        )?;
    }

    writeln!(
        out,
        "<h{h4} id=\"{key}-firsts\"><a href=\"#{key}-firsts\">First Observations</a> ({})</h{h4}>",
        section.firsts.len()
    )?;
    writeln!(out, "<ul class=\"observations-container\">")?;
    for first in &section.firsts {
        let Some(species) = report.species(first.taxon_id) else {
            continue;
        };
        let observation_url = first
            .url
            .clone()
            .unwrap_or_else(|| observation_link(first.observation_id));
        let thumbnail = first
            .thumbnail_url
            .as_deref()
            .map(|src| format!("<img class=\"observation-thumbnail\" src=\"{}\" alt=\"\" /> ", attr(src)))
            .unwrap_or_default();
        writeln!(
            out,
            "<li class=\"observation filterable\"><a class=\"name\" href=\"{}/taxa/{}\">{}</a> \
             <a href=\"{}\">{}first observation by @{}</a></li>",
            INAT_WEB,
            first.taxon_id,
            bold_if(species_name(species, &options.locale), first.research_grade),
            attr(&observation_url),
            thumbnail,
            text(&first.observer)
        )?;
    }
    writeln!(out, "</ul>")?;

    writeln!(
        out,
        "<h{h4} id=\"{key}-notable\"><a href=\"#{key}-notable\">Notable Observations</a> ({})</h{h4}>",
        section.notables.len()
    )?;
    writeln!(out, "<ul>")?;
    for notable in &section.notables {
        let Some(species) = report.species(notable.taxon_id) else {
            continue;
        };
        let mut scope_url = format!("{}/observations?taxon_id={}", INAT_WEB, notable.taxon_id);
        if let Some(places) = section.scope.id.query_value() {
            scope_url = format!("{}&place_id={}", scope_url, places);
        }

        let observers = species
            .observers
            .iter()
            .map(|login| {
                let link = format!(
                    "<a href=\"{}\">@{}</a>",
                    attr(&with_query(
                        format!("{}/observations?user_id={}&taxon_id={}", INAT_WEB, login, species.taxon_id),
                        &options.context_query
                    )),
                    text(login)
                );
                bold_if(link, species.has_research_grade_from(login))
            })
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(
            out,
            "<li class=\"filterable\"><a href=\"{}/taxa/{}\">{}</a> observed by: {} (<a href=\"{}\">{} total</a>)</li>",
            INAT_WEB,
            species.taxon_id,
            bold_if(
                species_name(species, &options.locale),
                !species.research_grade_observers.is_empty()
            ),
            observers,
            attr(&scope_url),
            notable.scope_count
        )?;
    }
    writeln!(out, "</ul>")
}

fn observation_link(observation_id: u64) -> String {
    format!("{}/observations/{}", INAT_WEB, observation_id)
}

fn write_observers(out: &mut String, report: &Report, options: &RenderOptions) -> fmt::Result {
    let h2 = options.level(1);
    let listed: Vec<_> = report.observers.iter().filter(|o| o.has_highlights()).collect();
    let credited = report
        .observers
        .iter()
        .filter(|o| !o.unique_species.is_empty())
        .count();

    writeln!(out, "<h{h2} id=\"observers\">Observers</h{h2}>")?;
    writeln!(
        out,
        "<p>{} taxa uniquely observed by {} observers.</p>",
        report.uniquely_observed_count(),
        credited
    )?;

    for observer in listed {
        write_observer(out, report, observer, options)?;
    }
    Ok(())
}

fn write_observer(
    out: &mut String,
    report: &Report,
    observer: &ObserverSection,
    options: &RenderOptions,
) -> fmt::Result {
    let h3 = options.level(2);
    let h4 = options.level(3);

    writeln!(
        out,
        "<div class=\"filterable\"><h{h3} id=\"{}\"><a href=\"{}/people/{}\">@{}</a></h{h3}>",
        attr(&observer.login),
        INAT_WEB,
        attr(&observer.login),
        text(&observer.login)
    )?;

    let highlights: Vec<_> = observer.highlights().collect();
    if !highlights.is_empty() {
        writeln!(
            out,
            "<h{h4}>First and notable observations ({} firsts):</h{h4}>\n<ul>",
            observer.first_count()
        )?;
        for entry in highlights {
            let Some(species) = report.species(entry.taxon_id) else {
                continue;
            };
            // Broadest scope this observation is first in
            let badge = report
                .scopes
                .iter()
                .rev()
                .find(|s| entry.first_in.contains(&s.scope.key))
                .map(|s| format!(" &bull; {}", text(&s.scope.first_text)))
                .unwrap_or_default();
            let notable_in: Vec<String> = report
                .scopes
                .iter()
                .filter(|s| entry.notable_in.contains(&s.scope.key))
                .map(|s| text(&s.scope.name).into_owned())
                .collect();
            let notable = if notable_in.is_empty() {
                String::new()
            } else {
                format!(" (notable in {})", notable_in.join(", "))
            };
            writeln!(
                out,
                "<li><a href=\"{}\">{}</a>{}{}</li>",
                attr(&observation_link(entry.observation_id)),
                species_name(species, &options.locale),
                badge,
                notable
            )?;
        }
        writeln!(out, "</ul>")?;
    }

    if !observer.unique_species.is_empty() {
        writeln!(out, "<h{h4}>Unique taxa ({}):</h{h4}>\n<ul>", observer.unique_species.len())?;
    }
    for unique in &observer.unique_species {
        let Some(species) = report.species(unique.taxon_id) else {
            continue;
        };
        let taxon_url = if options.link_to_project {
            with_query(
                format!("{}/observations?taxon_id={}", INAT_WEB, species.taxon_id),
                &options.context_query,
            )
        } else {
            format!("{}/taxa/{}", INAT_WEB, species.taxon_id)
        };

        let mut classes = vec!["filterable".to_string()];
        if species.is_notable() {
            classes.push("notable".to_string());
        }
        classes.extend(
            species
                .scopes
                .iter()
                .filter(|s| s.notable)
                .map(|s| format!("{}-notable", s.scope_key)),
        );

        let others = if unique.other_observers > 0 {
            format!(" ({})", unique.other_observers)
        } else {
            String::new()
        };
        let badge = species
            .highest_first_text
            .as_deref()
            .map(|t| format!(" &bull; {}", text(t)))
            .unwrap_or_default();

        writeln!(
            out,
            "<li class=\"{}\"><a href=\"{}\">{}</a>{}{}</li>",
            attr(&classes.join(" ")),
            attr(&taxon_url),
            bold_if(species_name(species, &options.locale), unique.has_research_grade),
            others,
            badge
        )?;
    }
    if !observer.unique_species.is_empty() {
        writeln!(out, "</ul>")?;
    }
    writeln!(out, "</div>")
}

fn write_footer(out: &mut String, report: &Report, h2: u8) -> fmt::Result {
    let excluded = &report.excluded;
    writeln!(out, "<h{h2} id=\"about\">About this report</h{h2}>")?;
    writeln!(
        out,
        "<p>{} observations were classified. Left out: {} not identified to species, \
         {} casual, {} duplicate rows.</p>",
        report.classified_observations,
        excluded.not_species_level,
        excluded.casual,
        excluded.duplicate
    )?;
    let unknown: Vec<String> = report
        .scopes
        .iter()
        .filter(|s| s.unknown > 0)
        .map(|s| format!("{}: {}", text(&s.scope.name), s.unknown))
        .collect();
    if !unknown.is_empty() {
        writeln!(
            out,
            "<p class=\"unknown\">Unclassified observations per place: {}.</p>",
            unknown.join(", ")
        )?;
    }
    writeln!(
        out,
        "<p>Firsts and counts reflect iNaturalist data at the time this report was generated. \
         Observations uploaded later with earlier dates are not taken into account.</p>"
    )
}

/// Render `priority.html`, grouped by kingdom and then by family
pub fn render_priority_html(priority: &[PriorityObservation], options: &RenderOptions) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let h1 = options.level(0);
    let h2 = options.level(1);
    let h3 = options.level(2);

    writeln!(out, "<!DOCTYPE html>\n<meta charset=\"utf-8\" />")?;
    writeln!(out, "<title>{} - Priority Observations</title>\n{}", text(&options.title), STYLES)?;
    writeln!(out, "<h{h1}>Priority Observations</h{h1}>")?;
    writeln!(
        out,
        "<p>The following observations are in genera for which the project currently has no \
         species-level observations, and are therefore likely to be able to increase the species count.</p>"
    )?;

    let unnamed = |name: Option<&str>| text(name.unwrap_or("Unknown")).into_owned();
    let mut kingdom: Option<Option<&str>> = None;
    let mut family: Option<Option<&str>> = None;
    let mut in_family = false;

    for entry in priority {
        let lineage = &entry.lineage;
        let new_kingdom = kingdom != Some(lineage.kingdom.as_deref());
        let new_family = new_kingdom || family != Some(lineage.family.as_deref());

        if new_family && in_family {
            writeln!(out, "</div>")?;
            in_family = false;
        }
        if new_kingdom {
            writeln!(out, "<h{h2}>{}</h{h2}>", unnamed(lineage.kingdom.as_deref()))?;
            kingdom = Some(lineage.kingdom.as_deref());
        }
        if new_family {
            writeln!(
                out,
                "<h{h3}>{} &rarr; {} &rarr; {}</h{h3}>\n<div class=\"observations-container\">",
                unnamed(lineage.class.as_deref()),
                unnamed(lineage.order.as_deref()),
                unnamed(lineage.family.as_deref())
            )?;
            family = Some(lineage.family.as_deref());
            in_family = true;
        }

        let url = entry
            .url
            .clone()
            .unwrap_or_else(|| observation_link(entry.observation_id));
        let image = entry
            .image_url
            .as_deref()
            .map(|src| format!("<a href=\"{}\"><img src=\"{}\" alt=\"\" /></a>\n", attr(&url), attr(src)))
            .unwrap_or_default();
        writeln!(
            out,
            "<div class=\"observation\">\n<a class=\"name\" href=\"{}\">{}</a>\n{}</div>",
            attr(&url),
            text(lineage.genus.as_deref().unwrap_or(&entry.taxon_name)),
            image
        )?;
    }
    if in_family {
        writeln!(out, "</div>")?;
    }

    writeln!(
        out,
        "<p>{} priority observations. Last updated: {}</p>",
        priority.len(),
        options.generated_on.format("%Y-%m-%d")
    )?;
    Ok(out)
}

/// Write one row per species with per-scope first/notable/count columns
pub fn write_species_csv<W: Write>(report: &Report, writer: W) -> Result<(), csv::Error> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec![
        "taxon_id".to_string(),
        "scientific_name".to_string(),
        "common_name".to_string(),
        "species_guess".to_string(),
        "project_observation_count".to_string(),
        "observers".to_string(),
        "research_grade_observers".to_string(),
        "uniquely_observed_by".to_string(),
        "notable".to_string(),
    ];
    for scope in &report.scopes {
        let key = &scope.scope.key;
        header.push(format!("{}_first", key));
        header.push(format!("{}_notable", key));
        header.push(format!("{}_observation_count", key));
    }
    csv.write_record(&header)?;

    for species in &report.species {
        let mut row = vec![
            species.taxon_id.to_string(),
            species.scientific_name.clone(),
            species.taxon.common_name.clone().unwrap_or_default(),
            species.taxon.species_guess.clone().unwrap_or_default(),
            species.project_count.to_string(),
            species.observers.join(" "),
            species.research_grade_observers.join(" "),
            species.unique_to.clone().unwrap_or_default(),
            species.is_notable().to_string(),
        ];
        for status in &species.scopes {
            row.push(status.first.is_some().to_string());
            row.push(status.notable.to_string());
            row.push(status.scope_count.map(|c| c.to_string()).unwrap_or_default());
        }
        csv.write_record(&row)?;
    }

    csv.flush()?;
    Ok(())
}
