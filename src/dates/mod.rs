//! Date expression resolution for retrieval queries.
//!
//! Turns free-text date phrases ("next 3 days", "latest", "on 12-09-2025")
//! into concrete filter windows over circular display dates and corporate
//! action ex-dates. All resolution is relative to an injected `today` so the
//! precedence rules stay testable; the public entry point plugs in the local
//! clock.

use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime, Weekday};
use regex::Regex;

/// Trailing window length for recency cues ("latest", "recent").
const RECENCY_WINDOW_DAYS: u64 = 15;

/// Subject keywords a generic "corporate action" query is expanded into.
/// Circular vocabulary rarely uses the literal phrase, so lexical recall
/// needs the disjunction.
const CORPORATE_ACTION_TERMS: &[&str] = &[
    "dividend",
    "bonus",
    "rights",
    "distribution",
    "buy-back",
    "face value",
    "demerger",
];

// ============================================================================
// Types
// ============================================================================

/// Resolved date constraint for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateFilter {
    /// Inclusive `[start, end]` window, both at midnight.
    Window {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// A single exact date at midnight.
    Exact(NaiveDateTime),
    /// The query carries no date constraint.
    Unconstrained,
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve a date constraint from a free-text query against today's date.
pub fn resolve(query: &str) -> DateFilter {
    resolve_at(query, Local::now().date_naive())
}

/// Resolve a date constraint relative to an explicit `today`.
///
/// Precedence:
/// 1. recency cue -> trailing 15-day window ending today
/// 2. "next N days" / "next week" / "next month" -> forward window from
///    tomorrow, end advanced off non-trading days
/// 3. an absolute date anywhere in the text -> exact-date filter
/// 4. otherwise unconstrained
pub fn resolve_at(query: &str, today: NaiveDate) -> DateFilter {
    if has_recency_cue(query) {
        let end = today.and_hms_opt(0, 0, 0).expect("midnight");
        let start = today
            .checked_sub_days(Days::new(RECENCY_WINDOW_DAYS))
            .unwrap_or(today)
            .and_hms_opt(0, 0, 0)
            .expect("midnight");
        return DateFilter::Window { start, end };
    }

    if let Some((start, end)) = resolve_forward_window(query, today) {
        let end = next_trading_day(end);
        return DateFilter::Window {
            start: start.and_hms_opt(0, 0, 0).expect("midnight"),
            end: end.and_hms_opt(0, 0, 0).expect("midnight"),
        };
    }

    if let Some(date) = parse_absolute_date(query) {
        let date = next_trading_day(date);
        return DateFilter::Exact(date.and_hms_opt(0, 0, 0).expect("midnight"));
    }

    DateFilter::Unconstrained
}

fn has_recency_cue(query: &str) -> bool {
    let re = Regex::new(r"(?i)\b(latest|recent|new)\b").expect("invalid regex");
    re.is_match(query)
}

/// Match "next N days" / "next week" / "next month" and compute the window
/// relative to tomorrow.
fn resolve_forward_window(query: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let tomorrow = today.succ_opt()?;

    let days_re = Regex::new(r"(?i)\bnext\s+(\d{1,3})\s+days?\b").expect("invalid regex");
    if let Some(caps) = days_re.captures(query) {
        let n: u64 = caps[1].parse().ok()?;
        let end = tomorrow.checked_add_days(Days::new(n))?;
        return Some((tomorrow, end));
    }

    let week_re = Regex::new(r"(?i)\bnext\s+week\b").expect("invalid regex");
    if week_re.is_match(query) {
        // The following Monday through Sunday.
        let mut monday = tomorrow;
        while monday.weekday() != Weekday::Mon {
            monday = monday.succ_opt()?;
        }
        let sunday = monday.checked_add_days(Days::new(6))?;
        return Some((monday, sunday));
    }

    let month_re = Regex::new(r"(?i)\bnext\s+month\b").expect("invalid regex");
    if month_re.is_match(query) {
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let last = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?;
        return Some((first, last));
    }

    None
}

/// Scan the query for an absolute date in any of the formats the corpus and
/// its users actually produce.
fn parse_absolute_date(query: &str) -> Option<NaiveDate> {
    // (pattern, chrono format) pairs, tried in order of specificity.
    let candidates: [(&str, &str); 6] = [
        (
            r"(?i)\b\d{1,2}\s+(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{4}\b",
            "%d %B %Y",
        ),
        (
            r"(?i)\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2},\s*\d{4}\b",
            "%B %d, %Y",
        ),
        (r"\b\d{4}-\d{2}-\d{2}\b", "%Y-%m-%d"),
        (r"(?i)\b\d{1,2}-(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)-\d{4}\b", "%d-%b-%Y"),
        (r"\b\d{1,2}-\d{1,2}-\d{4}\b", "%d-%m-%Y"),
        (r"\b\d{1,2}/\d{1,2}/\d{4}\b", "%d/%m/%Y"),
    ];

    for (pattern, format) in candidates {
        let re = Regex::new(pattern).expect("invalid regex");
        if let Some(m) = re.find(query) {
            // Collapse "September 12,2025" style spacing before parsing.
            let text = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            if let Ok(date) = NaiveDate::parse_from_str(&text, format) {
                return Some(date);
            }
        }
    }

    None
}

// ============================================================================
// Trading-day helpers
// ============================================================================

/// Whether the exchange trades on this date. Weekends only; holiday
/// calendars are out of scope here.
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advance a date to the next trading day if it falls on a weekend.
pub fn next_trading_day(mut date: NaiveDate) -> NaiveDate {
    while !is_trading_day(date) {
        date = date.succ_opt().unwrap_or(date);
    }
    date
}

/// The first trading day strictly after `date`.
pub fn trading_day_after(date: NaiveDate) -> NaiveDate {
    next_trading_day(date.succ_opt().unwrap_or(date))
}

// ============================================================================
// Query expansion
// ============================================================================

/// Expand a generic "corporate action(s)" mention into the subject keywords
/// those records actually carry.
pub fn expand_corporate_action_terms(query: &str) -> String {
    let re = Regex::new(r"(?i)\bcorporate\s+actions?\b").expect("invalid regex");
    if re.is_match(query) {
        format!("{} {}", query, CORPORATE_ACTION_TERMS.join(" "))
    } else {
        query.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_latest_produces_trailing_window() {
        // 2025-09-24 is a Wednesday.
        let today = date(2025, 9, 24);
        let filter = resolve_at("latest circular on mutual funds", today);
        assert_eq!(
            filter,
            DateFilter::Window {
                start: date(2025, 9, 9).and_hms_opt(0, 0, 0).unwrap(),
                end: today.and_hms_opt(0, 0, 0).unwrap(),
            }
        );
    }

    #[test]
    fn test_next_three_days_from_wednesday() {
        let today = date(2025, 9, 24); // Wednesday
        let filter = resolve_at("List circulars in next 3 days", today);
        // Start tomorrow (Thursday), end three days later (Sunday), advanced
        // to Monday.
        assert_eq!(
            filter,
            DateFilter::Window {
                start: date(2025, 9, 25).and_hms_opt(0, 0, 0).unwrap(),
                end: date(2025, 9, 29).and_hms_opt(0, 0, 0).unwrap(),
            }
        );
    }

    #[test]
    fn test_next_week_is_monday_through_sunday() {
        let today = date(2025, 9, 24); // Wednesday
        let filter = resolve_at("corporate actions next week", today);
        match filter {
            DateFilter::Window { start, end } => {
                assert_eq!(start.date(), date(2025, 9, 29)); // next Monday
                // Sunday 2025-10-05 advanced to Monday.
                assert_eq!(end.date(), date(2025, 10, 6));
            }
            other => panic!("expected window, got {:?}", other),
        }
    }

    #[test]
    fn test_next_month_spans_calendar_month() {
        let today = date(2025, 12, 10);
        let filter = resolve_at("circulars next month", today);
        match filter {
            DateFilter::Window { start, end } => {
                assert_eq!(start.date(), date(2026, 1, 1));
                // 2026-01-31 is a Saturday, advanced to Monday.
                assert_eq!(end.date(), date(2026, 2, 2));
            }
            other => panic!("expected window, got {:?}", other),
        }
    }

    #[test]
    fn test_recency_wins_over_forward_window() {
        let today = date(2025, 9, 24);
        let filter = resolve_at("latest circulars for the next 3 days", today);
        match filter {
            DateFilter::Window { end, .. } => assert_eq!(end.date(), today),
            other => panic!("expected recency window, got {:?}", other),
        }
    }

    #[test]
    fn test_absolute_date_becomes_exact_filter() {
        let today = date(2025, 9, 24);
        let filter = resolve_at("circulars issued on 12-09-2025", today);
        assert_eq!(
            filter,
            DateFilter::Exact(date(2025, 9, 12).and_hms_opt(0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_absolute_date_weekend_shifts_forward() {
        let today = date(2025, 9, 24);
        // 2025-09-13 is a Saturday.
        let filter = resolve_at("circulars on September 13, 2025", today);
        assert_eq!(
            filter,
            DateFilter::Exact(date(2025, 9, 15).and_hms_opt(0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_no_constraint() {
        let filter = resolve_at("what is the T+1 settlement cycle?", date(2025, 9, 24));
        assert_eq!(filter, DateFilter::Unconstrained);
    }

    #[test]
    fn test_new_requires_word_boundary() {
        // "news" must not trigger the recency cue.
        let filter = resolve_at("news about settlement on 12-09-2025", date(2025, 9, 24));
        assert!(matches!(filter, DateFilter::Exact(_)));
    }

    #[test]
    fn test_trading_day_helpers() {
        assert!(is_trading_day(date(2025, 9, 24))); // Wednesday
        assert!(!is_trading_day(date(2025, 9, 27))); // Saturday
        assert_eq!(next_trading_day(date(2025, 9, 27)), date(2025, 9, 29));
        assert_eq!(next_trading_day(date(2025, 9, 24)), date(2025, 9, 24));
        assert_eq!(trading_day_after(date(2025, 9, 26)), date(2025, 9, 29));
    }

    #[test]
    fn test_corporate_action_expansion() {
        let expanded = expand_corporate_action_terms("corporate actions in next 3 days");
        assert!(expanded.contains("dividend"));
        assert!(expanded.contains("demerger"));
        assert!(expanded.starts_with("corporate actions in next 3 days"));

        let untouched = expand_corporate_action_terms("mutual fund circulars");
        assert_eq!(untouched, "mutual fund circulars");
    }
}
