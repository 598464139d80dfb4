//! Hybrid two-stage retrieval.
//!
//! Dense prefetch over an oversized candidate set, lexical BM25 rerank,
//! then expansion of each circular hit to its full document context:
//! regulatory meaning often spans pages, so a single relevance hit must pull
//! in its sibling pages. Date constraints resolved from the query text are
//! pushed into the dense stage as metadata filters.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::dates::{self, DateFilter};
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::index::{LanceIndex, LexicalStore, RecordKind, RetrievedUnit};

/// Dense-stage candidate multiplier: prefetch this many times `top_k`, so
/// the lexical rerank has something real to choose from.
const PREFETCH_MULTIPLIER: usize = 16;

/// Sibling-page fan-out cap per hit.
const PAGE_FANOUT: usize = 5;

// ============================================================================
// HybridRetriever
// ============================================================================

/// Two-stage retriever over the hybrid store.
pub struct HybridRetriever {
    lance: LanceIndex,
    lexical: LexicalStore,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl HybridRetriever {
    /// Open the stores under `data_dir`.
    pub async fn open(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let lance = LanceIndex::open(&data_dir.join("vectors.lance")).await?;
        let lexical = LexicalStore::open(&data_dir.join("lexical.db"))?;
        Ok(Self {
            lance,
            lexical,
            embedder,
        })
    }

    /// Search with the date constraint resolved from the query itself.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedUnit>> {
        let filter = dates::resolve(query);
        self.search_filtered(query, top_k, filter).await
    }

    /// Search under an explicit date constraint. Failures surface as
    /// [`PipelineError::Retrieval`]; an empty candidate set is an empty
    /// result, not an error.
    pub async fn search_filtered(
        &self,
        query: &str,
        top_k: usize,
        filter: DateFilter,
    ) -> Result<Vec<RetrievedUnit>> {
        self.search_inner(query, top_k, filter)
            .await
            .map_err(|e| anyhow::Error::new(PipelineError::Retrieval(format!("{:#}", e))))
    }

    async fn search_inner(
        &self,
        query: &str,
        top_k: usize,
        filter: DateFilter,
    ) -> Result<Vec<RetrievedUnit>> {
        let expanded_query = dates::expand_corporate_action_terms(query);
        let predicate = date_predicate(&filter);
        let prefetch = PREFETCH_MULTIPLIER * top_k.max(1);

        // Stage 1: dense prefetch.
        let query_vector = self.embedder.embed_query(&expanded_query).await?;
        let candidates = self
            .lance
            .vector_search(&query_vector, prefetch, predicate.as_deref())
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Stage 2: lexical rerank of the candidate set. Candidates without a
        // BM25 match keep their dense order behind the matched ones.
        let lexical_scores: HashMap<String, f32> = self
            .lexical
            .search_bm25(&expanded_query, prefetch)?
            .into_iter()
            .map(|hit| (hit.unit_id, hit.score))
            .collect();

        let mut ranked = candidates;
        ranked.sort_by(|a, b| {
            match (
                lexical_scores.get(&a.unit_id),
                lexical_scores.get(&b.unit_id),
            ) {
                (Some(x), Some(y)) => y.partial_cmp(x).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
        ranked.truncate(top_k);

        // Corporate actions have no page structure: they bypass expansion
        // and re-enter at the front in rank order.
        let mut front: Vec<RetrievedUnit> = Vec::new();
        let mut expanded: Vec<RetrievedUnit> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for hit in ranked {
            match hit.kind {
                RecordKind::CorporateAction => {
                    if seen.insert(hit.unit_id.clone()) {
                        front.push(hit);
                    }
                }
                RecordKind::Circular => {
                    let siblings = self.lance.scroll_record(&hit.record_id, PAGE_FANOUT).await?;
                    for unit in siblings {
                        if seen.insert(unit.unit_id.clone()) {
                            expanded.push(unit);
                        }
                    }
                }
            }
        }

        // Most recent document first; a document's pages stay contiguous and
        // in reading order.
        expanded.sort_by(|a, b| {
            b.display_date
                .cmp(&a.display_date)
                .then_with(|| a.record_id.cmp(&b.record_id))
                .then_with(|| a.page_number.cmp(&b.page_number))
        });

        front.extend(expanded);
        Ok(front)
    }
}

// ============================================================================
// Date predicate
// ============================================================================

/// Render a resolved date constraint as a SQL predicate over the two date
/// columns. Always an OR across the fields: a unit carries at most one of
/// them, an AND could never match.
fn date_predicate(filter: &DateFilter) -> Option<String> {
    match filter {
        DateFilter::Unconstrained => None,
        DateFilter::Exact(at) => {
            let ts = to_ts(at);
            Some(format!(
                "(display_date_ts = {ts}) OR (ex_date_ts = {ts})"
            ))
        }
        DateFilter::Window { start, end } => {
            let (s, e) = (to_ts(start), to_ts(end));
            Some(format!(
                "(display_date_ts >= {s} AND display_date_ts <= {e}) \
                 OR (ex_date_ts >= {s} AND ex_date_ts <= {e})"
            ))
        }
    }
}

fn to_ts(dt: &NaiveDateTime) -> i64 {
    dt.and_utc().timestamp()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{Document, Page};
    use crate::index::test_support::StubEmbedding;
    use crate::index::IndexWriter;
    use crate::source::records::{CircularRecord, CorporateActionRecord};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn circular(id: &str, date: &str, pages: Vec<(&str, u32)>) -> CircularRecord {
        CircularRecord {
            id: Some(id.to_string()),
            file_link: format!("https://archives.example.com/{}.pdf", id),
            filename: None,
            department: "Surveillance".to_string(),
            circular_number: format!("{}/2025", id),
            category: "Trading".to_string(),
            display_date: date.to_string(),
            subject: format!("Subject of {}", id),
            documents: vec![Document {
                filename: format!("{}.pdf", id),
                pages: pages
                    .into_iter()
                    .map(|(text, n)| Page {
                        page_number: n,
                        page_text: text.to_string(),
                        tables: vec![],
                    })
                    .collect(),
            }],
        }
    }

    fn action(id: &str, symbol: &str, subject: &str, ex_date: &str) -> CorporateActionRecord {
        CorporateActionRecord {
            id: Some(id.to_string()),
            symbol: symbol.to_string(),
            company: format!("{} Limited", symbol),
            subject: subject.to_string(),
            ex_date: ex_date.to_string(),
            record_date: ex_date.to_string(),
            series: "EQ".to_string(),
            face_value: "10".to_string(),
        }
    }

    async fn build_store(dir: &TempDir) -> HybridRetriever {
        let embedder = Arc::new(StubEmbedding::new());
        let writer = IndexWriter::open(dir.path(), embedder.clone()).await.unwrap();
        writer.ensure_collection().await.unwrap();

        let circulars = vec![
            circular(
                "r1",
                "2025-09-25T00:00:00",
                vec![
                    ("settlement holiday schedule published", 1),
                    ("clearing banks remain open as usual", 2),
                    ("custodian obligations are unchanged", 3),
                    ("annexure lists affected segments", 4),
                ],
            ),
            circular(
                "r2",
                "2025-09-10T00:00:00",
                vec![("mutual fund disclosure norms tightened", 1)],
            ),
        ];
        let actions = vec![action(
            "ca1",
            "ABC",
            "Dividend - Rs 2 Per Share",
            "2025-09-29T00:00:00",
        )];

        let mut units = writer.build_circular_units(&circulars);
        units.extend(writer.build_corporate_action_units(&actions));
        writer.upsert(units).await.unwrap();

        HybridRetriever::open(dir.path(), embedder).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_hit_expands_to_all_pages() {
        let dir = TempDir::new().unwrap();
        let retriever = build_store(&dir).await;

        // Identical text pins the dense stage to one page of r1; the result
        // must still carry the whole document in reading order.
        let results = retriever
            .search_filtered(
                "custodian obligations are unchanged",
                1,
                DateFilter::Unconstrained,
            )
            .await
            .unwrap();

        let r1_pages: Vec<i32> = results
            .iter()
            .filter(|u| u.record_id == "r1")
            .map(|u| u.page_number)
            .collect();
        assert_eq!(r1_pages, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_corporate_action_hits_lead_the_results() {
        let dir = TempDir::new().unwrap();
        let retriever = build_store(&dir).await;

        let results = retriever
            .search_filtered(
                "ABC ABC Limited Dividend - Rs 2 Per Share",
                3,
                DateFilter::Unconstrained,
            )
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].kind, RecordKind::CorporateAction);
        assert_eq!(results[0].symbol, "ABC");
        // No duplicates anywhere in the expanded set.
        let mut ids: Vec<&str> = results.iter().map(|u| u.unit_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
    }

    #[tokio::test]
    async fn test_recent_documents_sort_first() {
        let dir = TempDir::new().unwrap();
        let retriever = build_store(&dir).await;

        let results = retriever
            .search_filtered(
                "mutual fund disclosure norms settlement holiday",
                5,
                DateFilter::Unconstrained,
            )
            .await
            .unwrap();

        let circulars: Vec<&RetrievedUnit> = results
            .iter()
            .filter(|u| u.kind == RecordKind::Circular)
            .collect();
        assert!(circulars.len() >= 2);
        for pair in circulars.windows(2) {
            assert!(pair[0].display_date >= pair[1].display_date);
        }
    }

    #[tokio::test]
    async fn test_date_window_filters_candidates() {
        let dir = TempDir::new().unwrap();
        let retriever = build_store(&dir).await;

        // Window covering only 2025-09-20 .. 2025-09-30: r2 (09-10) is out.
        let window = DateFilter::Window {
            start: NaiveDate::from_ymd_opt(2025, 9, 20)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 9, 30)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        };
        let results = retriever
            .search_filtered("disclosure settlement dividend", 10, window)
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert!(results.iter().all(|u| u.record_id != "r2"));
        // Both date fields participate: the corporate action (ex-date 09-29)
        // passes through the OR branch.
        assert!(results.iter().any(|u| u.kind == RecordKind::CorporateAction));
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_result() {
        let dir = TempDir::new().unwrap();
        let retriever = HybridRetriever::open(dir.path(), Arc::new(StubEmbedding::new()))
            .await
            .unwrap();

        let results = retriever
            .search_filtered("anything", 5, DateFilter::Unconstrained)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_date_predicate_is_an_or_across_fields() {
        let exact = DateFilter::Exact(
            NaiveDate::from_ymd_opt(2025, 9, 25)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        let predicate = date_predicate(&exact).unwrap();
        assert!(predicate.contains("display_date_ts"));
        assert!(predicate.contains("ex_date_ts"));
        assert!(predicate.contains(" OR "));
        assert!(!predicate.contains(") AND ("));

        assert!(date_predicate(&DateFilter::Unconstrained).is_none());
    }
}
