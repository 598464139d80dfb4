//! LanceDB dense vector index.
//!
//! One table holds every index unit with its flattened record metadata, the
//! named dense vector column, and epoch-second date columns that make
//! range filters cheap SQL predicates. ANN search runs under cosine
//! distance; sibling-page lookups are plain filtered scans.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use super::{IndexUnit, RecordKind, RetrievedUnit};

/// Collection name.
pub const TABLE_NAME: &str = "nsechatbot-rag-sparse_dense";

/// Named dense vector space.
pub const DENSE_VECTOR_COLUMN: &str = "dense-text";

/// Dense embedding dimension.
pub const EMBEDDING_DIMENSION: i32 = 768;

// ============================================================================
// LanceIndex
// ============================================================================

/// LanceDB-backed dense index.
pub struct LanceIndex {
    db: Connection,
}

impl LanceIndex {
    /// Open the database at `path` (a `.lance` directory).
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db })
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("unit_id", DataType::Utf8, false),
            Field::new("record_id", DataType::Utf8, false),
            Field::new("kind", DataType::Utf8, false),
            Field::new("department", DataType::Utf8, false),
            Field::new("category", DataType::Utf8, false),
            Field::new("subject", DataType::Utf8, false),
            Field::new("file_link", DataType::Utf8, false),
            Field::new("display_date", DataType::Utf8, false),
            Field::new("ex_date", DataType::Utf8, false),
            Field::new("symbol", DataType::Utf8, false),
            Field::new("series", DataType::Utf8, false),
            Field::new("face_value", DataType::Utf8, false),
            Field::new("company", DataType::Utf8, false),
            Field::new("document_name", DataType::Utf8, false),
            Field::new("page_number", DataType::Int32, false),
            Field::new("display_date_ts", DataType::Int64, true),
            Field::new("ex_date_ts", DataType::Int64, true),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                DENSE_VECTOR_COLUMN,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    EMBEDDING_DIMENSION,
                ),
                false,
            ),
        ])
    }

    /// Create the collection if absent. Idempotent, safe to call every run.
    pub async fn ensure_table(&self) -> Result<()> {
        if self.table_exists().await {
            tracing::debug!("collection {} already exists", TABLE_NAME);
            return Ok(());
        }

        tracing::info!("creating collection {}", TABLE_NAME);
        self.db
            .create_empty_table(TABLE_NAME, Arc::new(Self::schema()))
            .execute()
            .await
            .context("Failed to create table")?;
        Ok(())
    }

    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.contains(&TABLE_NAME.to_string()))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table")
    }

    fn units_to_batch(units: &[IndexUnit]) -> Result<RecordBatch> {
        if units.is_empty() {
            anyhow::bail!("Cannot create batch from empty units");
        }

        let strings = |f: fn(&IndexUnit) -> &str| -> Arc<dyn Array> {
            Arc::new(StringArray::from(
                units.iter().map(f).collect::<Vec<&str>>(),
            ))
        };

        let embeddings_flat: Vec<f32> = units
            .iter()
            .flat_map(|u| u.dense.iter().copied())
            .collect();
        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            EMBEDDING_DIMENSION,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::schema()),
            vec![
                strings(|u| &u.unit_id),
                strings(|u| &u.record_id),
                Arc::new(StringArray::from(
                    units.iter().map(|u| u.kind.as_str()).collect::<Vec<&str>>(),
                )),
                strings(|u| &u.department),
                strings(|u| &u.category),
                strings(|u| &u.subject),
                strings(|u| &u.file_link),
                strings(|u| &u.display_date),
                strings(|u| &u.ex_date),
                strings(|u| &u.symbol),
                strings(|u| &u.series),
                strings(|u| &u.face_value),
                strings(|u| &u.company),
                strings(|u| &u.document_name),
                Arc::new(Int32Array::from(
                    units.iter().map(|u| u.page_number).collect::<Vec<i32>>(),
                )),
                Arc::new(Int64Array::from(
                    units
                        .iter()
                        .map(|u| u.display_date_ts)
                        .collect::<Vec<Option<i64>>>(),
                )),
                Arc::new(Int64Array::from(
                    units.iter().map(|u| u.ex_date_ts).collect::<Vec<Option<i64>>>(),
                )),
                strings(|u| &u.content),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    /// Append a batch of units.
    pub async fn add_units(&self, units: &[IndexUnit]) -> Result<usize> {
        if units.is_empty() {
            return Ok(0);
        }

        self.ensure_table().await?;
        let batch = Self::units_to_batch(units)?;
        let schema = batch.schema();

        let table = self.open_table().await?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(batches)
            .execute()
            .await
            .context("Failed to add units to table")?;

        Ok(units.len())
    }

    /// Build the filterable secondary indexes: exact-match on department and
    /// category, range-capable on the two date columns, and record id for
    /// sibling-page scans.
    pub async fn create_scalar_indexes(&self) -> Result<()> {
        if !self.table_exists().await {
            return Ok(());
        }
        let table = self.open_table().await?;

        for column in [
            "department",
            "category",
            "display_date_ts",
            "ex_date_ts",
            "record_id",
        ] {
            if let Err(e) = table.create_index(&[column], Index::Auto).execute().await {
                // Small tables index lazily; queries stay correct either way.
                tracing::debug!("scalar index on {} not created: {}", column, e);
            }
        }
        Ok(())
    }

    /// Dense ANN search under cosine distance, optionally constrained by a
    /// SQL filter over the metadata columns.
    pub async fn vector_search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter: Option<&str>,
    ) -> Result<Vec<RetrievedUnit>> {
        if !self.table_exists().await {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;
        let mut query = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        if let Some(predicate) = filter {
            query = query.only_if(predicate.to_string());
        }

        let results = query
            .execute()
            .await
            .context("Failed to execute vector search")?;
        let batches: Vec<RecordBatch> = results.try_collect().await?;

        batches_to_units(&batches)
    }

    /// All units of one parent record, capped at `limit` (the page fan-out
    /// bound).
    pub async fn scroll_record(&self, record_id: &str, limit: usize) -> Result<Vec<RetrievedUnit>> {
        if !self.table_exists().await {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;
        let predicate = format!("record_id = '{}'", record_id.replace('\'', "''"));
        let results = table
            .query()
            .only_if(predicate)
            .limit(limit)
            .execute()
            .await
            .context("Failed to scroll record")?;
        let batches: Vec<RecordBatch> = results.try_collect().await?;

        batches_to_units(&batches)
    }

    /// Number of indexed units.
    pub async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }
        let table = self.open_table().await?;
        let count = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(count)
    }
}

// ============================================================================
// Batch decoding
// ============================================================================

fn batches_to_units(batches: &[RecordBatch]) -> Result<Vec<RetrievedUnit>> {
    let mut units = Vec::new();

    for batch in batches {
        let get_str = |name: &str| -> Result<&StringArray> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
        };

        let unit_ids = get_str("unit_id")?;
        let record_ids = get_str("record_id")?;
        let kinds = get_str("kind")?;
        let departments = get_str("department")?;
        let categories = get_str("category")?;
        let subjects = get_str("subject")?;
        let file_links = get_str("file_link")?;
        let display_dates = get_str("display_date")?;
        let ex_dates = get_str("ex_date")?;
        let symbols = get_str("symbol")?;
        let series = get_str("series")?;
        let face_values = get_str("face_value")?;
        let companies = get_str("company")?;
        let document_names = get_str("document_name")?;
        let contents = get_str("content")?;

        let page_numbers = batch
            .column_by_name("page_number")
            .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
            .ok_or_else(|| anyhow::anyhow!("Missing page_number column"))?;

        // _distance only exists on vector-search results.
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for i in 0..batch.num_rows() {
            units.push(RetrievedUnit {
                unit_id: unit_ids.value(i).to_string(),
                record_id: record_ids.value(i).to_string(),
                kind: RecordKind::parse(kinds.value(i)),
                department: departments.value(i).to_string(),
                category: categories.value(i).to_string(),
                subject: subjects.value(i).to_string(),
                file_link: file_links.value(i).to_string(),
                display_date: display_dates.value(i).to_string(),
                ex_date: ex_dates.value(i).to_string(),
                symbol: symbols.value(i).to_string(),
                series: series.value(i).to_string(),
                face_value: face_values.value(i).to_string(),
                company: companies.value(i).to_string(),
                document_name: document_names.value(i).to_string(),
                page_number: page_numbers.value(i),
                content: contents.value(i).to_string(),
                distance: distances.map(|d| d.value(i)).unwrap_or(0.0),
            });
        }
    }

    Ok(units)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::test_unit;
    use super::*;
    use tempfile::TempDir;

    async fn create_test_index() -> (TempDir, LanceIndex) {
        let dir = TempDir::new().unwrap();
        let index = LanceIndex::open(&dir.path().join("test.lance"))
            .await
            .unwrap();
        index.ensure_table().await.unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn test_ensure_table_idempotent() {
        let (_dir, index) = create_test_index().await;
        index.ensure_table().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_and_count() {
        let (_dir, index) = create_test_index().await;

        let units = vec![test_unit("u1", "r1", 1), test_unit("u2", "r1", 2)];
        assert_eq!(index.add_units(&units).await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_vector_search_returns_metadata() {
        let (_dir, index) = create_test_index().await;
        index
            .add_units(&[test_unit("u1", "r1", 1), test_unit("u2", "r2", 1)])
            .await
            .unwrap();

        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        let hits = index.vector_search(&query, 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].kind, RecordKind::Circular);
        assert!(!hits[0].content.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_with_date_filter() {
        let (_dir, index) = create_test_index().await;
        let mut recent = test_unit("u1", "r1", 1);
        recent.display_date_ts = Some(2_000);
        let mut old = test_unit("u2", "r2", 1);
        old.display_date_ts = Some(500);
        index.add_units(&[recent, old]).await.unwrap();

        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        let filter = "(display_date_ts >= 1000 AND display_date_ts <= 3000) \
                      OR (ex_date_ts >= 1000 AND ex_date_ts <= 3000)";
        let hits = index.vector_search(&query, 10, Some(filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit_id, "u1");
    }

    #[tokio::test]
    async fn test_scroll_record_bounded() {
        let (_dir, index) = create_test_index().await;
        let units: Vec<IndexUnit> = (1..=7).map(|p| test_unit(&format!("u{}", p), "r1", p)).collect();
        index.add_units(&units).await.unwrap();
        index.add_units(&[test_unit("other", "r2", 1)]).await.unwrap();

        let pages = index.scroll_record("r1", 5).await.unwrap();
        assert_eq!(pages.len(), 5);
        assert!(pages.iter().all(|u| u.record_id == "r1"));
    }

    #[tokio::test]
    async fn test_search_empty_table() {
        let dir = TempDir::new().unwrap();
        let index = LanceIndex::open(&dir.path().join("empty.lance"))
            .await
            .unwrap();
        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        assert!(index.vector_search(&query, 5, None).await.unwrap().is_empty());
        assert!(index.scroll_record("r1", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_scalar_indexes_tolerates_small_tables() {
        let (_dir, index) = create_test_index().await;
        index.add_units(&[test_unit("u1", "r1", 1)]).await.unwrap();
        index.create_scalar_indexes().await.unwrap();
    }
}
