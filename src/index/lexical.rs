//! Lexical (sparse) index - SQLite FTS5.
//!
//! The sparse side of the hybrid store: every index unit's text goes into an
//! FTS5 virtual table keyed by unit id, and retrieval reranks dense
//! candidates by BM25 score. Unit ids are fresh per ingestion run, so
//! re-indexed content simply arrives under new ids.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};

/// FTS5 table backing the sparse vector space.
const FTS_TABLE: &str = "lexical_text";

/// One BM25 hit.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub unit_id: String,
    /// BM25 relevance, higher is better (sqlite's raw bm25() is
    /// lower-is-better, so the sign is flipped).
    pub score: f32,
}

// ============================================================================
// LexicalStore
// ============================================================================

/// FTS5-backed lexical store.
pub struct LexicalStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl LexicalStore {
    /// Open (and create if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Create the FTS5 table if absent. Idempotent, safe to call every run.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5(
                    unit_id UNINDEXED,
                    content
                )",
                FTS_TABLE
            ),
            [],
        )
        .context("Failed to create FTS5 table")?;

        tracing::debug!("Lexical store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// Insert a batch of (unit id, content) rows.
    pub fn insert_batch(&self, rows: &[(String, String)]) -> Result<usize> {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {}(unit_id, content) VALUES (?1, ?2)",
                    FTS_TABLE
                ))
                .context("Failed to prepare insert")?;
            for (unit_id, content) in rows {
                stmt.execute(params![unit_id, content])
                    .context("Failed to insert lexical row")?;
            }
        }
        tx.commit().context("Failed to commit lexical batch")?;

        Ok(rows.len())
    }

    /// BM25 keyword search, best match first.
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    pub fn search_bm25(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let escaped_query = escape_fts5_query(query);
        if escaped_query.is_empty() {
            return Ok(vec![]);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT unit_id, bm25({table}) AS score
             FROM {table}
             WHERE {table} MATCH ?1
             ORDER BY bm25({table})
             LIMIT ?2",
            table = FTS_TABLE
        ))?;

        let hits = stmt
            .query_map(params![escaped_query, limit as i64], |row| {
                let unit_id: String = row.get(0)?;
                let raw: f64 = row.get(1)?;
                Ok(LexicalHit {
                    unit_id,
                    score: (-raw) as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(hits)
    }

    /// Number of indexed rows.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", FTS_TABLE), [], |row| {
                row.get(0)
            })
            .unwrap_or(0);
        Ok(count as usize)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Strip FTS5 query syntax down to plain words.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn escape_fts5_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    trimmed
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
