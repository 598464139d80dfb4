//! Circular and corporate-action sourcing.
//!
//! Fetches raw records from the exchange API for a date window, normalizes
//! them (internal-field drop, dedup by source link, canonical timestamps),
//! downloads attachments with a browser-emulating session, and drives the
//! PDF extractor over each attachment with bounded parallelism.

pub mod records;
pub mod sync;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::PipelineError;
use crate::extractor::PdfExtractor;
use records::{
    action_date_to_iso, display_date_to_iso, CircularRecord, CorporateActionRecord,
};
use sync::FetchWindow;

/// Exchange site root; priming it sets the cookies the API endpoints expect.
const BASE_URL: &str = "https://www.nseindia.com";

/// Download retry budget across the whole batch.
const MAX_DOWNLOAD_ATTEMPTS: usize = 4;

/// Concurrent attachment extractions.
const EXTRACTION_WORKERS: usize = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The API envelope is a foreign format; only the `data` list matters.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

// ============================================================================
// CircularSource
// ============================================================================

/// Client for the circular/corporate-action APIs and the attachment host.
pub struct CircularSource {
    client: reqwest::Client,
    folder: PathBuf,
}

impl CircularSource {
    /// Create a source writing attachments under `folder`.
    ///
    /// One shared client carries the session cookies across the priming
    /// request, the API calls and the attachment downloads; the upstream
    /// service rejects non-browser agents.
    pub fn new(folder: &Path) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(browser_headers())
            .cookie_store(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            folder: folder.to_path_buf(),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Fetch circulars for a window. `None` means the window held nothing
    /// new: a normal outcome, not a failure.
    pub async fn fetch_circulars(
        &self,
        window: &FetchWindow,
    ) -> Result<Option<Vec<CircularRecord>>> {
        self.warm_up().await;

        let url = format!(
            "{}/api/circulars?fromDate={}&toDate={}",
            BASE_URL,
            window.start.format("%d-%m-%Y"),
            window.end.format("%d-%m-%Y"),
        );
        let envelope = self.get_envelope(&url).await?;

        let circulars = prepare_circulars(envelope.data);
        tracing::info!("fetched {} circulars", circulars.len());
        Ok(if circulars.is_empty() {
            None
        } else {
            Some(circulars)
        })
    }

    /// Fetch corporate actions (equities and SME merged) for a window,
    /// sorted ascending by ex-date. `None` on an empty window.
    pub async fn fetch_corporate_actions(
        &self,
        window: &FetchWindow,
    ) -> Result<Option<Vec<CorporateActionRecord>>> {
        self.warm_up().await;

        let mut raw = Vec::new();
        for index in ["equities", "sme"] {
            let url = format!(
                "{}/api/corporates-corporateActions?index={}&from_date={}&to_date={}",
                BASE_URL,
                index,
                window.start.format("%d-%m-%Y"),
                window.end.format("%d-%m-%Y"),
            );
            raw.extend(self.get_envelope(&url).await?.data);
        }

        let actions = prepare_corporate_actions(raw);
        tracing::info!("fetched {} corporate actions", actions.len());
        Ok(if actions.is_empty() {
            None
        } else {
            Some(actions)
        })
    }

    /// Download every record's attachment that is not already on disk.
    /// Individual failures are logged and contained; re-invocation is
    /// idempotent by filename presence.
    pub async fn download_attachments(&self, circulars: &[CircularRecord]) -> Result<()> {
        std::fs::create_dir_all(self.folder.join("pdfs"))
            .context("failed to create pdfs folder")?;
        std::fs::create_dir_all(self.folder.join("zips"))
            .context("failed to create zips folder")?;

        for record in circulars {
            let Some(path) = record.attachment_path(&self.folder) else {
                continue;
            };
            if path.exists() {
                continue;
            }
            if let Err(e) = self.download_one(&record.file_link, &path).await {
                tracing::warn!("{}", e);
            }
        }

        Ok(())
    }

    async fn download_one(&self, link: &str, path: &Path) -> Result<(), PipelineError> {
        let response = self
            .client
            .get(link)
            .send()
            .await
            .map_err(|e| PipelineError::AttachmentDownload {
                link: link.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PipelineError::AttachmentDownload {
                link: link.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::AttachmentDownload {
                link: link.to_string(),
                reason: e.to_string(),
            })?;

        std::fs::write(path, &bytes).map_err(|e| PipelineError::AttachmentDownload {
            link: link.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!("downloaded {} ({} bytes)", link, bytes.len());
        Ok(())
    }

    /// Records whose attachment has not landed on disk yet.
    pub fn missing_attachments<'a>(
        &self,
        circulars: &'a [CircularRecord],
    ) -> Vec<&'a CircularRecord> {
        circulars
            .iter()
            .filter(|r| {
                r.attachment_path(&self.folder)
                    .map(|p| !p.exists())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Re-download the known-missing set, up to the attempt cap. Returns the
    /// links still missing afterwards; completion is best-effort, not a
    /// per-record success guarantee.
    pub async fn retry_missing(&self, circulars: &[CircularRecord]) -> Result<Vec<String>> {
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            let missing = self.missing_attachments(circulars);
            if missing.is_empty() {
                return Ok(Vec::new());
            }

            tracing::info!(
                "retrying {} missing attachments (attempt {}/{})",
                missing.len(),
                attempt,
                MAX_DOWNLOAD_ATTEMPTS
            );
            let subset: Vec<CircularRecord> = missing.into_iter().cloned().collect();
            self.download_attachments(&subset).await?;
        }

        let still_missing: Vec<String> = self
            .missing_attachments(circulars)
            .into_iter()
            .map(|r| r.file_link.clone())
            .collect();
        for link in &still_missing {
            tracing::warn!("attachment still missing after retries: {}", link);
        }
        Ok(still_missing)
    }

    /// Run extraction over every record with a bounded worker pool. The
    /// returned list is re-sorted by display date ascending regardless of
    /// completion order.
    pub async fn extract_all(&self, circulars: Vec<CircularRecord>) -> Vec<CircularRecord> {
        let semaphore = Arc::new(Semaphore::new(EXTRACTION_WORKERS));
        let total = circulars.len();
        let folder = self.folder.clone();

        let tasks = circulars.into_iter().enumerate().map(|(i, record)| {
            let semaphore = Arc::clone(&semaphore);
            let folder = folder.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let link = record.file_link.clone();
                let processed = extract_content(record, &folder).await;
                tracing::info!("[{}/{}] extracted {}", i + 1, total, link);
                processed
            }
        });

        let mut processed = futures::future::join_all(tasks).await;
        processed.sort_by(|a: &CircularRecord, b: &CircularRecord| {
            a.display_date.cmp(&b.display_date)
        });
        processed
    }

    async fn warm_up(&self) {
        // Best-effort cookie priming; the API call itself will report real
        // failures.
        if let Err(e) = self.client.get(BASE_URL).send().await {
            tracing::debug!("warm-up request failed: {}", e);
        }
    }

    async fn get_envelope(&self, url: &str) -> Result<ApiEnvelope> {
        let response = self.client.get(url).send().await.map_err(|e| {
            anyhow::Error::new(PipelineError::SourceFetch(format!("{}: {}", url, e)))
        })?;

        if !response.status().is_success() {
            return Err(anyhow::Error::new(PipelineError::SourceFetch(format!(
                "{}: HTTP {}",
                url,
                response.status()
            ))));
        }

        response.json::<ApiEnvelope>().await.map_err(|e| {
            anyhow::Error::new(PipelineError::SourceFetch(format!(
                "malformed envelope from {}: {}",
                url, e
            )))
        })
    }
}

// ============================================================================
// Record preparation
// ============================================================================

/// Parse, dedup and normalize raw circular values. First occurrence of a
/// source link wins; order is preserved.
pub fn prepare_circulars(raw: Vec<serde_json::Value>) -> Vec<CircularRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut circulars = Vec::new();

    for value in raw {
        let mut record: CircularRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("skipping unparseable circular: {}", e);
                continue;
            }
        };

        if !seen.insert(record.file_link.clone()) {
            continue;
        }

        // Filenames without a real extension have no downloadable content.
        if record
            .filename
            .as_deref()
            .map(|f| f.ends_with(".null"))
            .unwrap_or(false)
        {
            continue;
        }

        match display_date_to_iso(&record.display_date) {
            Ok(iso) => record.display_date = iso,
            Err(e) => tracing::warn!("{:#}", e),
        }

        circulars.push(record);
    }

    circulars
}

/// Parse and normalize raw corporate-action values, sorted ascending by
/// ex-date.
pub fn prepare_corporate_actions(raw: Vec<serde_json::Value>) -> Vec<CorporateActionRecord> {
    let mut actions = Vec::new();

    for value in raw {
        let mut record: CorporateActionRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("skipping unparseable corporate action: {}", e);
                continue;
            }
        };

        match action_date_to_iso(&record.ex_date) {
            Ok(iso) => record.ex_date = iso,
            Err(e) => tracing::warn!("{:#}", e),
        }
        match action_date_to_iso(&record.record_date) {
            Ok(iso) => record.record_date = iso,
            Err(e) => tracing::debug!("{:#}", e),
        }
        record.id = Some(uuid::Uuid::new_v4().simple().to_string());

        actions.push(record);
    }

    actions.sort_by(|a, b| a.ex_date.cmp(&b.ex_date));
    actions
}

/// Extract one record's attachment content. Missing attachments and
/// extraction failures degrade to an empty document list; the record is
/// always retained and gets its generated id.
pub async fn extract_content(mut record: CircularRecord, folder: &Path) -> CircularRecord {
    record.id = Some(uuid::Uuid::new_v4().simple().to_string());

    let Some(path) = record.attachment_path(folder) else {
        record.filename = None;
        return record;
    };

    if !path.exists() {
        tracing::warn!(
            "attachment missing for {}, indexing metadata only",
            record.file_link
        );
        record.filename = None;
        return record;
    }

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("failed to read {:?}: {}", path, e);
            record.filename = None;
            return record;
        }
    };

    let meta = record.record_meta();
    let filename = record.filename.clone().unwrap_or_default();
    let extracted =
        tokio::task::spawn_blocking(move || PdfExtractor::new(meta).extract(&bytes, &filename))
            .await;

    match extracted {
        Ok(Ok(documents)) => record.documents = documents,
        Ok(Err(e)) => {
            let err = PipelineError::Extraction {
                filename: record.filename.clone().unwrap_or_default(),
                reason: format!("{:#}", e),
            };
            tracing::warn!("{}", err);
        }
        Err(e) => tracing::warn!("extraction task panicked: {}", e),
    }

    record.filename = None;
    record
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        reqwest::header::REFERER,
        HeaderValue::from_static("https://www.nseindia.com/"),
    );
    headers.insert(
        reqwest::header::ORIGIN,
        HeaderValue::from_static("https://www.nseindia.com"),
    );
    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        reqwest::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw_circular(link: &str, filename: &str, date: &str) -> serde_json::Value {
        serde_json::json!({
            "circFilelink": link,
            "circFilename": filename,
            "fileDept": "Surveillance",
            "circNumber": "25/2025",
            "circCategory": "Trading",
            "cirDisplayDate": date,
            "sub": "Subject text",
            "circFileSize": "100KB",
        })
    }

    #[test]
    fn test_prepare_circulars_dedups_first_seen() {
        // Five raw records, two sharing links with earlier ones: 5 - 2 = 3.
        let raw = vec![
            raw_circular("https://x/a.pdf", "a.pdf", "September 25, 2025"),
            raw_circular("https://x/b.pdf", "b.pdf", "September 26, 2025"),
            raw_circular("https://x/a.pdf", "a_dup.pdf", "September 27, 2025"),
            raw_circular("https://x/c.pdf", "c.pdf", "September 28, 2025"),
            raw_circular("https://x/b.pdf", "b_dup.pdf", "September 29, 2025"),
        ];

        let circulars = prepare_circulars(raw);
        assert_eq!(circulars.len(), 3);
        // First-seen order preserved, duplicates dropped.
        assert_eq!(circulars[0].filename.as_deref(), Some("a.pdf"));
        assert_eq!(circulars[1].filename.as_deref(), Some("b.pdf"));
        assert_eq!(circulars[2].filename.as_deref(), Some("c.pdf"));
    }

    #[test]
    fn test_prepare_circulars_converts_dates_and_filters_null() {
        let raw = vec![
            raw_circular("https://x/a.pdf", "a.pdf", "September 25, 2025"),
            raw_circular("https://x/broken", "broken.null", "September 26, 2025"),
        ];

        let circulars = prepare_circulars(raw);
        assert_eq!(circulars.len(), 1);
        assert_eq!(circulars[0].display_date, "2025-09-25T00:00:00");
    }

    #[test]
    fn test_prepare_corporate_actions_sorted_by_ex_date() {
        let raw = vec![
            serde_json::json!({
                "symbol": "ZZZ", "comp": "ZZZ Ltd", "subject": "Bonus 1:1",
                "exDate": "30-Sep-2025", "recDate": "01-Oct-2025",
                "series": "EQ", "faceVal": "10",
            }),
            serde_json::json!({
                "symbol": "AAA", "comp": "AAA Ltd", "subject": "Dividend",
                "exDate": "26-Sep-2025", "recDate": "27-Sep-2025",
                "series": "EQ", "faceVal": "1",
            }),
        ];

        let actions = prepare_corporate_actions(raw);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].symbol, "AAA");
        assert_eq!(actions[0].ex_date, "2025-09-26T00:00:00");
        assert_eq!(actions[1].symbol, "ZZZ");
        assert!(actions[0].id.is_some());
    }

    #[tokio::test]
    async fn test_extract_content_missing_attachment() {
        let dir = TempDir::new().unwrap();
        let record: CircularRecord = serde_json::from_value(raw_circular(
            "https://x/a.pdf",
            "a.pdf",
            "September 25, 2025",
        ))
        .unwrap();

        let processed = extract_content(record, dir.path()).await;
        // Download failure degrades to metadata-only, never drops the record.
        assert!(processed.id.is_some());
        assert!(processed.documents.is_empty());
        assert!(processed.filename.is_none());
    }

    #[tokio::test]
    async fn test_extract_all_sorts_by_display_date() {
        let dir = TempDir::new().unwrap();
        let source = CircularSource::new(dir.path()).unwrap();

        let later: CircularRecord = serde_json::from_value(raw_circular(
            "https://x/b.pdf",
            "b.pdf",
            "September 26, 2025",
        ))
        .unwrap();
        let earlier: CircularRecord = serde_json::from_value(raw_circular(
            "https://x/a.pdf",
            "a.pdf",
            "September 25, 2025",
        ))
        .unwrap();

        let mut records = prepare_circulars(vec![
            serde_json::to_value(&later).unwrap(),
            serde_json::to_value(&earlier).unwrap(),
        ]);
        // prepare_circulars keeps input order; extraction must re-sort.
        assert_eq!(records[0].filename.as_deref(), Some("b.pdf"));
        records.truncate(2);

        let processed = source.extract_all(records).await;
        assert_eq!(processed.len(), 2);
        assert!(processed[0].display_date <= processed[1].display_date);
    }

    #[test]
    fn test_missing_attachments_is_explicit_per_record() {
        let dir = TempDir::new().unwrap();
        let source = CircularSource::new(dir.path()).unwrap();

        std::fs::create_dir_all(dir.path().join("pdfs")).unwrap();
        std::fs::write(dir.path().join("pdfs").join("a.pdf"), b"%PDF").unwrap();
        // An unrelated file in the folder must not hide a missing record.
        std::fs::write(dir.path().join("pdfs").join("stray.pdf"), b"%PDF").unwrap();

        let present: CircularRecord = serde_json::from_value(raw_circular(
            "https://x/a.pdf",
            "a.pdf",
            "September 25, 2025",
        ))
        .unwrap();
        let absent: CircularRecord = serde_json::from_value(raw_circular(
            "https://x/b.pdf",
            "b.pdf",
            "September 25, 2025",
        ))
        .unwrap();

        let records = vec![present, absent];
        let missing = source.missing_attachments(&records);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].file_link, "https://x/b.pdf");
    }
}
