use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::catalog::{Catalog, CatalogEntry, Category};
use crate::error::{FailureKind, ParseError};
use crate::ledger::{CheckpointRecord, Ledger};
use crate::parser::{self, ParsedCase};

const CHUNK: usize = 500;

#[derive(Debug, Default)]
pub struct ReprocessSummary {
    pub considered: usize,
    pub missing_artifact: usize,
    pub parsed: usize,
    pub failed: usize,
}

/// Re-parse every stored artifact in scope and write the results as one new
/// checkpoint shard. No network access.
pub fn reprocess(
    catalog: &Catalog,
    artifacts: &ArtifactStore,
    ledger: &mut Ledger,
    category: Option<Category>,
    show_progress: bool,
) -> Result<ReprocessSummary> {
    let entries: Vec<&CatalogEntry> = catalog
        .entries()
        .iter()
        .filter(|e| category.map_or(true, |c| c == e.category))
        .collect();
    let mut summary = ReprocessSummary {
        considered: entries.len(),
        ..Default::default()
    };

    let pb = if show_progress {
        let pb = ProgressBar::new(entries.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    for chunk in entries.chunks(CHUNK) {
        let results: Vec<_> = chunk
            .par_iter()
            .map(|entry| reparse(artifacts, entry))
            .collect();

        for (entry, result) in chunk.iter().zip(results) {
            match result? {
                None => summary.missing_artifact += 1,
                Some(Ok(case)) => {
                    ledger.append(CheckpointRecord::succeeded(entry, 1));
                    ledger.append_case(case);
                    summary.parsed += 1;
                }
                Some(Err(e)) => {
                    warn!(document_id = %entry.document_id, "reparse failed: {}", e);
                    ledger.append(CheckpointRecord::failed(
                        entry,
                        FailureKind::ParseError,
                        1,
                        e.to_string(),
                    ));
                    summary.failed += 1;
                }
            }
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    ledger.flush()?;
    info!(
        parsed = summary.parsed,
        failed = summary.failed,
        missing = summary.missing_artifact,
        "reprocess finished"
    );
    Ok(summary)
}

fn reparse(
    artifacts: &ArtifactStore,
    entry: &CatalogEntry,
) -> Result<Option<Result<ParsedCase, ParseError>>> {
    let Some(bytes) = artifacts.read(entry.category, &entry.document_id)? else {
        return Ok(None);
    };
    Ok(Some(parser::parse(&bytes, entry)))
}
