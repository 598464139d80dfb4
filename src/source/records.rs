//! Corpus record types and persistence.
//!
//! Field names mirror the upstream NSE API (a foreign format: unknown fields
//! are dropped on deserialization, nothing is validated against a schema).
//! Corpus files are UTF-8 JSON arrays written by whole-file replace, so a
//! failed run never leaves a half-written corpus.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::extractor::{Document, RecordMeta};

/// Processed circulars corpus file.
pub const CIRCULARS_FILE: &str = "final_processed_circulars.json";
/// Corporate actions corpus file.
pub const CORPORATE_ACTIONS_FILE: &str = "corporate_actions.json";

// ============================================================================
// Records
// ============================================================================

/// A regulatory circular. Identity key is the source file link; records are
/// never mutated after persistence, later fetches supersede them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircularRecord {
    /// Assigned at extraction time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "circFilelink")]
    pub file_link: String,
    /// Raw attachment filename; removed from the persisted form once the
    /// content has been extracted.
    #[serde(
        rename = "circFilename",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub filename: Option<String>,
    #[serde(rename = "fileDept", default)]
    pub department: String,
    #[serde(rename = "circNumber", default)]
    pub circular_number: String,
    #[serde(rename = "circCategory", default)]
    pub category: String,
    /// ISO-8601 after normalization from the API's "September 25, 2025".
    #[serde(rename = "cirDisplayDate", default)]
    pub display_date: String,
    #[serde(rename = "sub", default)]
    pub subject: String,
    #[serde(default)]
    pub documents: Vec<Document>,
}

/// How a circular's attachment is stored on the attachment host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Pdf,
    Zip,
    Other,
}

impl CircularRecord {
    pub fn attachment_kind(&self) -> AttachmentKind {
        let link = self.file_link.to_lowercase();
        if link.ends_with(".pdf") {
            AttachmentKind::Pdf
        } else if link.ends_with(".zip") {
            AttachmentKind::Zip
        } else {
            AttachmentKind::Other
        }
    }

    /// Where the attachment lands under the save folder, if downloadable.
    pub fn attachment_path(&self, folder: &Path) -> Option<PathBuf> {
        let filename = self.filename.as_deref()?;
        match self.attachment_kind() {
            AttachmentKind::Pdf => Some(folder.join("pdfs").join(filename)),
            AttachmentKind::Zip => Some(folder.join("zips").join(filename)),
            AttachmentKind::Other => None,
        }
    }

    pub fn record_meta(&self) -> RecordMeta {
        RecordMeta {
            department: self.department.clone(),
            circular_number: self.circular_number.clone(),
            category: self.category.clone(),
            filename: self.filename.clone().unwrap_or_default(),
        }
    }

    pub fn display_date_parsed(&self) -> Option<NaiveDateTime> {
        parse_iso_datetime(&self.display_date)
    }
}

/// An equity/SME corporate action. No attached documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateActionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub symbol: String,
    #[serde(rename = "comp", default)]
    pub company: String,
    #[serde(default)]
    pub subject: String,
    /// ISO-8601 after normalization from the API's "25-Sep-2025".
    #[serde(rename = "exDate", default)]
    pub ex_date: String,
    #[serde(rename = "recDate", default)]
    pub record_date: String,
    #[serde(default)]
    pub series: String,
    #[serde(rename = "faceVal", default)]
    pub face_value: String,
}

impl CorporateActionRecord {
    pub fn ex_date_parsed(&self) -> Option<NaiveDateTime> {
        parse_iso_datetime(&self.ex_date)
    }
}

// ============================================================================
// Date conversion
// ============================================================================

/// "September 25, 2025" -> "2025-09-25T00:00:00".
pub fn display_date_to_iso(raw: &str) -> Result<String> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%B %d, %Y")
        .with_context(|| format!("unparseable display date: {:?}", raw))?;
    Ok(to_iso(date))
}

/// "25-Sep-2025" -> "2025-09-25T00:00:00".
pub fn action_date_to_iso(raw: &str) -> Result<String> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%d-%b-%Y")
        .with_context(|| format!("unparseable ex/record date: {:?}", raw))?;
    Ok(to_iso(date))
}

fn to_iso(date: NaiveDate) -> String {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight")
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

/// Parse a normalized ISO-8601 timestamp (date-only accepted too).
pub fn parse_iso_datetime(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// ============================================================================
// Corpus persistence
// ============================================================================

pub fn save_circulars(folder: &Path, records: &[CircularRecord]) -> Result<()> {
    write_json_atomic(&folder.join(CIRCULARS_FILE), records)
}

pub fn load_circulars(folder: &Path) -> Result<Vec<CircularRecord>> {
    read_json(&folder.join(CIRCULARS_FILE))
}

pub fn save_corporate_actions(folder: &Path, records: &[CorporateActionRecord]) -> Result<()> {
    write_json_atomic(&folder.join(CORPORATE_ACTIONS_FILE), records)
}

pub fn load_corporate_actions(folder: &Path) -> Result<Vec<CorporateActionRecord>> {
    read_json(&folder.join(CORPORATE_ACTIONS_FILE))
}

/// Whole-file replace: serialize to a sibling temp file, then rename over
/// the target.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_string_pretty(value).context("failed to serialize corpus")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {:?}", path))
}

// ============================================================================
// Tests
// ============================================================================
