//! Ingestion orchestration.
//!
//! One cycle: load sync state -> compute fetch windows -> fetch both streams
//! -> download and retry attachments -> parallel extraction -> persist the
//! corpus -> build and upsert index units -> commit the new boundaries.
//! A quiet window is a normal outcome ([`IngestOutcome::NothingNew`]), not a
//! failure; producing zero index units from a non-empty fetch is fatal.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};

use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::index::IndexWriter;
use crate::source::records::{
    save_circulars, save_corporate_actions, CircularRecord, CorporateActionRecord,
};
use crate::source::sync::{compute_next_window, StreamKind, SyncTracker};
use crate::source::CircularSource;

// ============================================================================
// Types
// ============================================================================

/// Result of one ingestion cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// New data was fetched, persisted and indexed.
    Indexed(IngestStats),
    /// The remote windows held nothing new. A no-op, distinct from failure.
    NothingNew,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IngestStats {
    pub circulars: usize,
    pub corporate_actions: usize,
    pub units_indexed: usize,
}

// ============================================================================
// Entry point
// ============================================================================

/// Run one ingestion cycle with the default (Gemini) embedder.
pub async fn run_ingestion(start_date: NaiveDate, save_folder: &Path) -> Result<IngestOutcome> {
    let embedder = Arc::new(create_embedder()?);
    run_ingestion_with(start_date, save_folder, embedder).await
}

/// Run one ingestion cycle with an explicit embedder.
pub async fn run_ingestion_with(
    start_date: NaiveDate,
    save_folder: &Path,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<IngestOutcome> {
    let today = Local::now().date_naive();
    let tracker = SyncTracker::new(save_folder);
    let state = tracker.load().context("failed to load sync state")?;

    let circular_window =
        compute_next_window(StreamKind::Circulars, start_date, state.circulars, today);
    let action_window = compute_next_window(
        StreamKind::CorporateActions,
        start_date,
        state.corporate_actions,
        today,
    );
    tracing::info!(
        "fetch windows: circulars {} .. {}, corporate actions {} .. {}",
        circular_window.start,
        circular_window.end,
        action_window.start,
        action_window.end
    );

    let source = CircularSource::new(save_folder)?;
    let circulars = source.fetch_circulars(&circular_window).await?;
    let actions = source.fetch_corporate_actions(&action_window).await?;

    if circulars.is_none() && actions.is_none() {
        tracing::info!("no new circulars or corporate actions in the windows");
        return Ok(IngestOutcome::NothingNew);
    }

    let processed = match circulars {
        Some(circulars) => {
            source.download_attachments(&circulars).await?;
            let still_missing = source.retry_missing(&circulars).await?;
            if !still_missing.is_empty() {
                tracing::warn!(
                    "{} attachments unrecoverable; their records index metadata-only",
                    still_missing.len()
                );
            }

            let processed = source.extract_all(circulars).await;
            save_circulars(save_folder, &processed)?;
            tracing::info!("persisted {} processed circulars", processed.len());
            processed
        }
        None => Vec::new(),
    };

    let actions = actions.unwrap_or_default();
    if !actions.is_empty() {
        save_corporate_actions(save_folder, &actions)?;
        tracing::info!("persisted {} corporate actions", actions.len());
    }

    let units_indexed = index_corpus(save_folder, &processed, &actions, embedder).await?;

    let (latest_circular, latest_action) = latest_dates(&processed, &actions);
    tracker
        .commit(latest_circular, latest_action)
        .context("failed to commit sync state")?;

    Ok(IngestOutcome::Indexed(IngestStats {
        circulars: processed.len(),
        corporate_actions: actions.len(),
        units_indexed,
    }))
}

/// Build units from the corpus and write them into the hybrid store.
/// Zero units is fatal: there is nothing meaningful to persist.
pub async fn index_corpus(
    save_folder: &Path,
    circulars: &[CircularRecord],
    actions: &[CorporateActionRecord],
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<usize> {
    let writer = IndexWriter::open(save_folder, embedder).await?;
    writer.ensure_collection().await?;

    let mut units = writer.build_circular_units(circulars);
    units.extend(writer.build_corporate_action_units(actions));

    let written = writer.upsert(units).await?;
    writer.create_indexes().await?;
    Ok(written)
}

/// The boundaries to commit: the maximum display/ex-date actually ingested,
/// never the requested window end.
pub fn latest_dates(
    circulars: &[CircularRecord],
    actions: &[CorporateActionRecord],
) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let latest_circular = circulars
        .iter()
        .filter_map(|r| r.display_date_parsed())
        .max()
        .map(|dt| dt.date());
    let latest_action = actions
        .iter()
        .filter_map(|a| a.ex_date_parsed())
        .max()
        .map(|dt| dt.date());
    (latest_circular, latest_action)
}

// ============================================================================
// Tests
// ============================================================================
