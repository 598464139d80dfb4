//! Incremental-sync bookkeeping.
//!
//! Persists the last successfully-indexed date boundary per source stream
//! and computes the next fetch window from it. The state file is a
//! single-writer resource: concurrent pipeline runs against the same folder
//! must be serialized externally (one scheduled run at a time).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::dates::trading_day_after;
use crate::source::records::write_json_atomic;

/// Tracking file name inside the save folder.
pub const SYNC_STATE_FILE: &str = "sync_state.json";

/// Window widening past a caught-up boundary, per stream. Corporate action
/// announcements are sparser, so their catch-up window is larger.
const CIRCULARS_CATCHUP_DAYS: u64 = 1;
const CORPORATE_ACTIONS_CATCHUP_DAYS: u64 = 10;

// ============================================================================
// Types
// ============================================================================

/// The two source streams tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Circulars,
    CorporateActions,
}

/// Last-ingested boundaries, loaded at the start of a cycle and committed at
/// the end of a successful one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub circulars: Option<NaiveDate>,
    #[serde(default)]
    pub corporate_actions: Option<NaiveDate>,
}

impl SyncState {
    pub fn boundary(&self, kind: StreamKind) -> Option<NaiveDate> {
        match kind {
            StreamKind::Circulars => self.circulars,
            StreamKind::CorporateActions => self.corporate_actions,
        }
    }
}

/// Inclusive fetch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

// ============================================================================
// Window computation
// ============================================================================

/// Compute the next fetch window for a stream.
///
/// If the requested start is on or before the last boundary, the window
/// advances to the first business day after the boundary, with the end
/// widened by the stream's catch-up horizon. On a first run with a start
/// strictly in the past, the corporate-action end extends past today to
/// capture near-term upcoming actions. Pure function of its inputs, so
/// repeated calls yield the same window.
pub fn compute_next_window(
    kind: StreamKind,
    requested_start: NaiveDate,
    last_boundary: Option<NaiveDate>,
    today: NaiveDate,
) -> FetchWindow {
    let catchup = match kind {
        StreamKind::Circulars => CIRCULARS_CATCHUP_DAYS,
        StreamKind::CorporateActions => CORPORATE_ACTIONS_CATCHUP_DAYS,
    };

    if let Some(boundary) = last_boundary {
        if requested_start <= boundary {
            let start = trading_day_after(boundary);
            let end = start.checked_add_days(Days::new(catchup)).unwrap_or(start);
            return FetchWindow { start, end };
        }
    }

    let mut end = today;
    if last_boundary.is_none()
        && requested_start < today
        && kind == StreamKind::CorporateActions
    {
        end = today
            .checked_add_days(Days::new(CORPORATE_ACTIONS_CATCHUP_DAYS))
            .unwrap_or(today);
    }

    FetchWindow {
        start: requested_start,
        end: end.max(requested_start),
    }
}

// ============================================================================
// SyncTracker
// ============================================================================

/// File-backed boundary store.
pub struct SyncTracker {
    path: PathBuf,
}

impl SyncTracker {
    pub fn new(folder: &Path) -> Self {
        Self {
            path: folder.join(SYNC_STATE_FILE),
        }
    }

    /// Load the persisted boundaries; an absent file means no prior state.
    pub fn load(&self) -> Result<SyncState> {
        if !self.path.exists() {
            return Ok(SyncState::default());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {:?}", self.path))?;
        serde_json::from_str(&data).with_context(|| format!("failed to parse {:?}", self.path))
    }

    /// Persist the boundaries as the maximum record dates actually ingested
    /// in the run, never the requested window end (advancing past dates
    /// with no data yet would skip them forever). Boundaries missing from
    /// this run keep their previous value.
    pub fn commit(
        &self,
        latest_circular: Option<NaiveDate>,
        latest_corporate_action: Option<NaiveDate>,
    ) -> Result<()> {
        let previous = self.load()?;
        let state = SyncState {
            circulars: latest_circular.or(previous.circulars),
            corporate_actions: latest_corporate_action.or(previous.corporate_actions),
        };
        write_json_atomic(&self.path, &state)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_advances_past_boundary() {
        // Boundary Thursday 2025-09-25; requested start before it.
        let window = compute_next_window(
            StreamKind::Circulars,
            date(2025, 9, 1),
            Some(date(2025, 9, 25)),
            date(2025, 9, 30),
        );
        assert_eq!(window.start, date(2025, 9, 26)); // Friday
        assert_eq!(window.end, date(2025, 9, 27));

        // Boundary on a Friday: next business day is Monday.
        let window = compute_next_window(
            StreamKind::Circulars,
            date(2025, 9, 1),
            Some(date(2025, 9, 26)),
            date(2025, 9, 30),
        );
        assert_eq!(window.start, date(2025, 9, 29));
    }

    #[test]
    fn test_corporate_actions_widen_further() {
        let window = compute_next_window(
            StreamKind::CorporateActions,
            date(2025, 9, 1),
            Some(date(2025, 9, 25)),
            date(2025, 9, 30),
        );
        assert_eq!(window.start, date(2025, 9, 26));
        assert_eq!(window.end, date(2025, 10, 6));
    }

    #[test]
    fn test_first_run_past_start_extends_action_end() {
        let today = date(2025, 9, 30);
        let window =
            compute_next_window(StreamKind::CorporateActions, date(2025, 9, 1), None, today);
        assert_eq!(window.start, date(2025, 9, 1));
        assert_eq!(window.end, date(2025, 10, 10));

        // Circulars stay bounded by today.
        let window = compute_next_window(StreamKind::Circulars, date(2025, 9, 1), None, today);
        assert_eq!(window.end, today);
    }

    #[test]
    fn test_requested_start_after_boundary_is_kept() {
        let window = compute_next_window(
            StreamKind::Circulars,
            date(2025, 9, 29),
            Some(date(2025, 9, 25)),
            date(2025, 9, 30),
        );
        assert_eq!(window.start, date(2025, 9, 29));
        assert_eq!(window.end, date(2025, 9, 30));
    }

    #[test]
    fn test_compute_next_window_idempotent() {
        let args = (
            StreamKind::Circulars,
            date(2025, 9, 1),
            Some(date(2025, 9, 25)),
            date(2025, 9, 30),
        );
        let first = compute_next_window(args.0, args.1, args.2, args.3);
        let second = compute_next_window(args.0, args.1, args.2, args.3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_tracker_load_commit_cycle() {
        let dir = TempDir::new().unwrap();
        let tracker = SyncTracker::new(dir.path());

        // First run: no prior state.
        assert_eq!(tracker.load().unwrap(), SyncState::default());

        tracker
            .commit(Some(date(2025, 9, 25)), Some(date(2025, 9, 29)))
            .unwrap();
        let state = tracker.load().unwrap();
        assert_eq!(state.circulars, Some(date(2025, 9, 25)));
        assert_eq!(state.corporate_actions, Some(date(2025, 9, 29)));

        // A run that ingested only circulars keeps the other boundary.
        tracker.commit(Some(date(2025, 9, 30)), None).unwrap();
        let state = tracker.load().unwrap();
        assert_eq!(state.circulars, Some(date(2025, 9, 30)));
        assert_eq!(state.corporate_actions, Some(date(2025, 9, 29)));
    }
}
