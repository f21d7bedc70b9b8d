//! Final persistence: table batch writes plus the per-source audit dumps.

use anyhow::{Context, Result};
use papersift_core::{RatingResult, Source};
use papersift_storage::{ResultDumpStore, StoredDump, TableDestination, TableRow, TableSink};
use serde::Serialize;
use tracing::{error, info, warn};

/// Write one source's results to its table. Empty collections are skipped.
pub async fn flush(
    table: &dyn TableSink,
    source: Source,
    results: &[RatingResult],
    destination: &TableDestination,
) -> Result<usize> {
    if results.is_empty() {
        warn!(%source, %destination, "no rated papers; skipping table write");
        return Ok(0);
    }

    let rows: Vec<TableRow> = results.iter().map(RatingResult::table_fields).collect();
    let written = table
        .batch_write(destination, &rows)
        .await
        .with_context(|| format!("writing {source} results to {destination}"))?;
    info!(%source, %destination, written, "table write finished");
    Ok(written)
}

/// What happened to one source's frozen collection.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: Source,
    pub records: usize,
    pub written: usize,
    pub dump: Option<StoredDump>,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Dump and flush one source. Errors are captured in the outcome so the caller can
/// finish every source before failing the run.
pub async fn persist_source(
    store: &ResultDumpStore,
    table: &dyn TableSink,
    source: Source,
    results: &[RatingResult],
    destination: &TableDestination,
) -> SourceOutcome {
    let mut errors = Vec::new();

    let dump = match store.write_results(source, results).await {
        Ok(dump) => {
            info!(%source, path = %dump.path.display(), records = dump.records, "results dumped");
            Some(dump)
        }
        Err(err) => {
            error!(%source, error = %format!("{err:#}"), "writing results dump failed");
            errors.push(format!("{err:#}"));
            None
        }
    };

    let written = match flush(table, source, results, destination).await {
        Ok(n) => n,
        Err(err) => {
            error!(%source, error = %format!("{err:#}"), "table write failed");
            errors.push(format!("{err:#}"));
            0
        }
    };

    SourceOutcome {
        source,
        records: results.len(),
        written,
        dump,
        error: (!errors.is_empty()).then(|| errors.join("; ")),
    }
}
