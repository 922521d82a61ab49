//! Incremental reduction of an occurrence page stream
//!
//! Pages are consumed one at a time and folded into (earliest record, count).
//! Nothing beyond the current page is held in memory.

use super::{OccurrenceFact, OccurrencePage, SourceError};
use futures::{Stream, StreamExt};
use ipstats_common::OccurrenceRecord;
use tracing::trace;

/// Fold a page stream into an occurrence fact
///
/// Stops pulling pages once a page's `floor` lies strictly after the current
/// earliest record and the source has reported a total: later pages cannot
/// contain an earlier or tied record, and the count is already known.
///
/// The resulting count is the larger of the records seen and the reported
/// total.
pub async fn reduce_pages<S>(mut pages: S) -> Result<OccurrenceFact, SourceError>
where
    S: Stream<Item = Result<OccurrencePage, SourceError>> + Unpin,
{
    let mut earliest: Option<OccurrenceRecord> = None;
    let mut seen: u64 = 0;
    let mut reported: Option<u64> = None;
    let mut pages_read = 0usize;

    while let Some(page) = pages.next().await {
        let page = page?;
        pages_read += 1;

        if let Some(total) = page.total_results {
            reported = Some(reported.map_or(total, |r| r.max(total)));
        }
        seen += page.records.len() as u64;

        for record in page.records.iter().filter_map(|r| r.to_record()) {
            if earliest.map_or(true, |current| record < current) {
                earliest = Some(record);
            }
        }

        if let (Some(floor), Some(current), Some(_)) = (page.floor, earliest, reported) {
            if floor > current.observed_at {
                trace!(pages_read, "Remaining pages cannot hold an earlier record");
                break;
            }
        }
    }

    Ok(OccurrenceFact {
        earliest,
        count: seen.max(reported.unwrap_or(0)),
    })
}
