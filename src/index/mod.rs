//! Hybrid index construction.
//!
//! Flattens the processed corpus into index units (one per circular page
//! with body text, one per corporate action) and writes them into the
//! hybrid store: the dense vector space in LanceDB and the lexical space in
//! FTS5. Units are immutable once written; re-embedding happens under new
//! ids on the next ingestion run.

pub mod lance;
pub mod lexical;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::extractor::Page;
use crate::source::records::{parse_iso_datetime, CircularRecord, CorporateActionRecord};

pub use lance::{LanceIndex, DENSE_VECTOR_COLUMN, EMBEDDING_DIMENSION, TABLE_NAME};
pub use lexical::{LexicalHit, LexicalStore};

/// Units per upsert batch; writes do not wait for index rebuilds.
const UPSERT_BATCH_SIZE: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Explicit record kind tag, carried from creation through retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Circular,
    CorporateAction,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Circular => "circular",
            RecordKind::CorporateAction => "corporate_action",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "corporate_action" => RecordKind::CorporateAction,
            _ => RecordKind::Circular,
        }
    }
}

/// The unit stored in the vector index: one circular page or one corporate
/// action, with flattened parent metadata and its dense embedding. The
/// lexical side is the FTS5 row under the same unit id.
#[derive(Debug, Clone)]
pub struct IndexUnit {
    pub unit_id: String,
    pub record_id: String,
    pub kind: RecordKind,
    pub department: String,
    pub category: String,
    pub subject: String,
    pub file_link: String,
    pub display_date: String,
    pub ex_date: String,
    pub symbol: String,
    pub series: String,
    pub face_value: String,
    pub company: String,
    pub document_name: String,
    pub page_number: i32,
    pub display_date_ts: Option<i64>,
    pub ex_date_ts: Option<i64>,
    pub content: String,
    pub dense: Vec<f32>,
}

/// A unit read back from the index.
#[derive(Debug, Clone)]
pub struct RetrievedUnit {
    pub unit_id: String,
    pub record_id: String,
    pub kind: RecordKind,
    pub department: String,
    pub category: String,
    pub subject: String,
    pub file_link: String,
    pub display_date: String,
    pub ex_date: String,
    pub symbol: String,
    pub series: String,
    pub face_value: String,
    pub company: String,
    pub document_name: String,
    pub page_number: i32,
    pub content: String,
    /// Dense distance (lower is closer); 0 for filter-only scans.
    pub distance: f32,
}

// ============================================================================
// IndexWriter
// ============================================================================

/// Writes index units into the hybrid store.
pub struct IndexWriter {
    lance: LanceIndex,
    lexical: LexicalStore,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl IndexWriter {
    /// Open both stores under `data_dir`.
    pub async fn open(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let lance = LanceIndex::open(&data_dir.join("vectors.lance"))
            .await
            .context("Failed to open vector store")?;
        let lexical = LexicalStore::open(&data_dir.join("lexical.db"))
            .context("Failed to open lexical store")?;

        Ok(Self {
            lance,
            lexical,
            embedder,
        })
    }

    /// Create the collection and the lexical table if absent. Idempotent.
    pub async fn ensure_collection(&self) -> Result<()> {
        self.lance.ensure_table().await?;
        self.lexical.initialize()
    }

    /// Build filterable secondary indexes so date-range filtering stays
    /// efficient at retrieval time.
    pub async fn create_indexes(&self) -> Result<()> {
        self.lance.create_scalar_indexes().await
    }

    /// One unit per page with non-empty body text, both embeddings computed
    /// from the same page text at upsert time.
    pub fn build_circular_units(&self, corpus: &[CircularRecord]) -> Vec<IndexUnit> {
        let mut units = Vec::new();

        for record in corpus {
            let record_id = record
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

            for document in &record.documents {
                for page in &document.pages {
                    if page.page_text.trim().is_empty() {
                        continue;
                    }

                    units.push(IndexUnit {
                        unit_id: uuid::Uuid::new_v4().simple().to_string(),
                        record_id: record_id.clone(),
                        kind: RecordKind::Circular,
                        department: record.department.clone(),
                        category: record.category.clone(),
                        subject: record.subject.clone(),
                        file_link: record.file_link.clone(),
                        display_date: record.display_date.clone(),
                        ex_date: String::new(),
                        symbol: String::new(),
                        series: String::new(),
                        face_value: String::new(),
                        company: String::new(),
                        document_name: document.filename.clone(),
                        page_number: page.page_number as i32,
                        display_date_ts: iso_to_ts(&record.display_date),
                        ex_date_ts: None,
                        content: page_content_text(page),
                        dense: Vec::new(),
                    });
                }
            }
        }

        units
    }

    /// One unit per corporate action; no paging.
    pub fn build_corporate_action_units(
        &self,
        actions: &[CorporateActionRecord],
    ) -> Vec<IndexUnit> {
        actions
            .iter()
            .map(|action| {
                let record_id = action
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

                IndexUnit {
                    unit_id: uuid::Uuid::new_v4().simple().to_string(),
                    record_id,
                    kind: RecordKind::CorporateAction,
                    department: String::new(),
                    category: String::new(),
                    subject: action.subject.clone(),
                    file_link: String::new(),
                    display_date: String::new(),
                    ex_date: action.ex_date.clone(),
                    symbol: action.symbol.clone(),
                    series: action.series.clone(),
                    face_value: action.face_value.clone(),
                    company: action.company.clone(),
                    document_name: String::new(),
                    page_number: 0,
                    display_date_ts: None,
                    ex_date_ts: iso_to_ts(&action.ex_date),
                    content: format!("{} {} {}", action.symbol, action.company, action.subject),
                    dense: Vec::new(),
                }
            })
            .collect()
    }

    /// Embed and write units in fixed-size batches. An empty unit list is
    /// fatal: the run produced nothing to index.
    pub async fn upsert(&self, mut units: Vec<IndexUnit>) -> Result<usize> {
        if units.is_empty() {
            return Err(anyhow::Error::new(PipelineError::IndexBuild));
        }

        let total = units.len();
        let mut written = 0;

        for chunk in units.chunks_mut(UPSERT_BATCH_SIZE) {
            let texts: Vec<String> = chunk.iter().map(|u| u.content.clone()).collect();
            let embeddings = self
                .embedder
                .embed_document_batch(&texts)
                .await
                .context("Failed to embed unit batch")?;
            for (unit, embedding) in chunk.iter_mut().zip(embeddings) {
                unit.dense = embedding;
            }

            self.lance.add_units(chunk).await?;
            let rows: Vec<(String, String)> = chunk
                .iter()
                .map(|u| (u.unit_id.clone(), u.content.clone()))
                .collect();
            self.lexical.insert_batch(&rows)?;

            written += chunk.len();
            tracing::info!("indexed {}/{} units", written, total);
        }

        Ok(written)
    }

    pub fn lance(&self) -> &LanceIndex {
        &self.lance
    }

    pub fn lexical(&self) -> &LexicalStore {
        &self.lexical
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Page body text with serialized table rows appended.
fn page_content_text(page: &Page) -> String {
    let mut text = page.page_text.trim_end().to_string();

    for table in &page.tables {
        text.push_str("\n\n");
        let rows: Vec<String> = table
            .content
            .iter()
            .map(|row| row.join(" | "))
            .collect();
        text.push_str(&rows.join("\n"));
    }

    text
}

/// Normalized ISO timestamp -> epoch seconds (UTC) for range filters.
fn iso_to_ts(iso: &str) -> Option<i64> {
    parse_iso_datetime(iso).map(|dt| dt.and_utc().timestamp())
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

    /// Deterministic text-derived embedding; identical text always gets the
    /// identical vector.
    pub struct StubEmbedding {
        pub dimension: usize,
    }

    impl StubEmbedding {
        pub fn new() -> Self {
            Self {
                dimension: EMBEDDING_DIMENSION as usize,
            }
        }

        fn pseudo_embed(&self, text: &str) -> Vec<f32> {
            let digest = Sha256::digest(text.as_bytes());
            (0..self.dimension)
                .map(|i| {
                    let byte = digest[i % digest.len()] as f32;
                    ((byte + i as f32) % 17.0) - 8.0
                })
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedding {
        async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self.pseudo_embed(text))
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self.pseudo_embed(text))
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    /// A circular unit with fixed metadata for store-level tests.
    pub fn test_unit(unit_id: &str, record_id: &str, page_number: i32) -> IndexUnit {
        IndexUnit {
            unit_id: unit_id.to_string(),
            record_id: record_id.to_string(),
            kind: RecordKind::Circular,
            department: "Surveillance".to_string(),
            category: "Trading".to_string(),
            subject: "Revision of margins".to_string(),
            file_link: format!("https://archives.example.com/{}.pdf", record_id),
            display_date: "2025-09-25T00:00:00".to_string(),
            ex_date: String::new(),
            symbol: String::new(),
            series: String::new(),
            face_value: String::new(),
            company: String::new(),
            document_name: format!("{}.pdf", record_id),
            page_number,
            display_date_ts: iso_to_ts("2025-09-25T00:00:00"),
            ex_date_ts: None,
            content: format!("test page {} of record {}", page_number, record_id),
            dense: vec![0.1; EMBEDDING_DIMENSION as usize],
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
