//! PDF and ZIP attachment extraction.
//!
//! Converts an attachment byte stream into per-page body text and table
//! grids. Table cell content is segregated from body text by spatial
//! exclusion against the detected table regions, so the two are never
//! duplicated during indexing. ZIP attachments are expanded into their PDF
//! members; the member matching the record's own filename is treated as the
//! circular itself.

pub mod layout;
pub mod table;

use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use lopdf::Document as PdfDocument;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use layout::{assemble_lines, PageContent};
use table::TableRegion;

// ============================================================================
// Types
// ============================================================================

/// Record metadata an extraction runs under. Table ids are derived from it,
/// not from cell content, so they survive minor text corrections.
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    pub department: String,
    pub circular_number: String,
    pub category: String,
    /// The record's own attachment filename (e.g. `CIR_12345.pdf`).
    pub filename: String,
}

/// One extracted table: a stable id and the 2-D grid of cell strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub table_id: String,
    pub content: Vec<Vec<String>>,
}

/// One PDF page: 1-based number, body text outside any table region, and the
/// tables found on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_number: u32,
    pub page_text: String,
    pub tables: Vec<Table>,
}

/// One attachment's extracted content (a PDF, or a PDF member of a ZIP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub pages: Vec<Page>,
}

// ============================================================================
// PdfExtractor
// ============================================================================

/// Extracts structured page content from attachment byte streams.
pub struct PdfExtractor {
    meta: RecordMeta,
}

impl PdfExtractor {
    pub fn new(meta: RecordMeta) -> Self {
        Self { meta }
    }

    /// Extract an attachment, dispatching on its filename extension.
    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<Vec<Document>> {
        let lower = filename.to_lowercase();
        if lower.ends_with(".pdf") {
            let own = file_stem_pdf(filename).eq_ignore_ascii_case(&self.meta.filename);
            let pages = self.extract_pdf(bytes, own)?;
            Ok(vec![Document {
                filename: filename.to_string(),
                pages,
            }])
        } else if lower.ends_with(".zip") {
            self.extract_zip(bytes)
        } else {
            anyhow::bail!("unsupported attachment type: {}", filename)
        }
    }

    /// Extract one PDF byte stream into pages.
    ///
    /// `leading_table_skip` applies the circular's-own-file rule: the first
    /// table on page 1 duplicates metadata already on the record and is
    /// dropped from the output. Its region still excludes words from body
    /// text.
    pub fn extract_pdf(&self, bytes: &[u8], leading_table_skip: bool) -> Result<Vec<Page>> {
        let doc = PdfDocument::load_mem(bytes).context("failed to open PDF")?;
        let interpreted = layout::interpret_pages(&doc)?;

        let mut pages = Vec::with_capacity(interpreted.len());
        for (page_number, content) in &interpreted {
            pages.push(self.build_page(*page_number, content, leading_table_skip));
        }

        // Content streams that yield no positioned text at all (scanned or
        // unusually encoded documents): fall back to plain text extraction.
        if pages.iter().all(|p| p.page_text.is_empty() && p.tables.is_empty()) {
            if let Some(fallback) = fallback_pages(bytes) {
                tracing::warn!(
                    "no positioned text recovered, using plain-text fallback ({} pages)",
                    fallback.len()
                );
                return Ok(fallback);
            }
        }

        Ok(pages)
    }

    /// Extract every PDF member of a ZIP attachment. The member whose name
    /// matches the record's own filename gets the leading-table skip; other
    /// members are ordinary attachments.
    pub fn extract_zip(&self, bytes: &[u8]) -> Result<Vec<Document>> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).context("failed to open ZIP attachment")?;

        let mut documents = Vec::new();
        for index in 0..archive.len() {
            let mut member = archive
                .by_index(index)
                .with_context(|| format!("failed to read ZIP member {}", index))?;
            let name = member.name().to_string();
            if !name.to_lowercase().ends_with(".pdf") {
                continue;
            }

            let mut member_bytes = Vec::new();
            member
                .read_to_end(&mut member_bytes)
                .with_context(|| format!("failed to read ZIP member {}", name))?;

            let filename = file_stem_pdf(&name);
            let own = filename.eq_ignore_ascii_case(&self.meta.filename);
            match self.extract_pdf(&member_bytes, own) {
                Ok(pages) => documents.push(Document { filename, pages }),
                Err(e) => {
                    // A corrupt member never aborts the archive.
                    tracing::warn!("extraction failed for ZIP member {}: {:#}", name, e);
                }
            }
        }

        Ok(documents)
    }

    fn build_page(
        &self,
        page_number: u32,
        content: &PageContent,
        leading_table_skip: bool,
    ) -> Page {
        let regions = table::detect_tables(&content.words, &content.rects);

        // Body text: words outside every detected region, skipped or not.
        let outside: Vec<layout::Word> = content
            .words
            .iter()
            .filter(|w| !regions.iter().any(|r| r.bbox.contains_word(w)))
            .cloned()
            .collect();
        let body = strip_subject_lines(&assemble_lines(&outside));

        let skip_first = leading_table_skip && page_number == 1;
        let tables = regions
            .iter()
            .enumerate()
            .skip(if skip_first { 1 } else { 0 })
            .map(|(ordinal, region)| self.build_table(region, ordinal, page_number))
            .collect();

        Page {
            page_number,
            page_text: body,
            tables,
        }
    }

    fn build_table(&self, region: &TableRegion, ordinal: usize, page_number: u32) -> Table {
        Table {
            table_id: self.table_id(ordinal, page_number),
            content: region.cells.clone(),
        }
    }

    /// Content-independent table id: metadata + table ordinal + page number.
    fn table_id(&self, ordinal: usize, page_number: u32) -> String {
        let combined = format!(
            "{}-{}-{}-{}-{}",
            self.meta.department,
            self.meta.circular_number,
            self.meta.category,
            ordinal,
            page_number
        );
        let digest = Sha256::digest(combined.as_bytes());
        format!("{:x}", digest)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Normalize a (possibly nested) member name to `<stem>.pdf`.
fn file_stem_pdf(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, _)) => format!("{}.pdf", stem),
        None => format!("{}.pdf", base),
    }
}

/// Remove `Subject: ...` restatement lines; they duplicate the record's
/// subject field.
fn strip_subject_lines(text: &str) -> String {
    let re = Regex::new(r"(?i)^\s*sub(?:ject)?\s*:").expect("invalid regex");
    let mut out = String::new();
    for line in text.lines() {
        if re.is_match(line) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Plain-text fallback via pdf-extract, one page per form feed.
fn fallback_pages(bytes: &[u8]) -> Option<Vec<Page>> {
    let text = pdf_extract::extract_text_from_mem(bytes).ok()?;
    if text.trim().is_empty() {
        return None;
    }

    let pages: Vec<Page> = text
        .split('\x0c')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, s)| Page {
            page_number: i as u32 + 1,
            page_text: strip_subject_lines(s),
            tables: Vec::new(),
        })
        .collect();

    if pages.is_empty() {
        None
    } else {
        Some(pages)
    }
}

// ============================================================================
// Tests
// ============================================================================
