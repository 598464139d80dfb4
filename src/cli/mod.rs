//! CLI commands: ingest, ask, search, status.
//!
//! Thin shell over the pipeline and retrieval modules. Exit codes matter to
//! schedulers: 0 success, 1 error, 2 "no new data" (a quiet window is not a
//! broken pipeline).

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::embedding::{create_embedder, has_api_key};
use crate::index::{LanceIndex, LexicalStore};
use crate::pipeline::{run_ingestion, IngestOutcome};
use crate::query::HybridRetriever;
use crate::rag::Assistant;

/// Exit code for the "nothing new" no-op outcome.
const EXIT_NOTHING_NEW: i32 = 2;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "nse-circular-rag")]
#[command(version, about = "RAG pipeline over NSE circulars and corporate actions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch, extract and index circulars and corporate actions
    Ingest {
        /// Start date (DD-MM-YYYY); defaults to today
        #[arg(long)]
        start: Option<String>,

        /// Folder for attachments, corpus files and indexes
        #[arg(long, default_value = "./data")]
        save_path: PathBuf,
    },

    /// Ask a question and stream the generated answer
    Ask {
        /// The question
        question: String,

        /// Retrieval depth
        #[arg(short, long, default_value = "15")]
        top_k: usize,

        /// Data folder
        #[arg(long, default_value = "./data")]
        save_path: PathBuf,
    },

    /// Inspect raw retrieval results without generation
    Search {
        /// Search query
        query: String,

        /// Result count limit
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// Data folder
        #[arg(long, default_value = "./data")]
        save_path: PathBuf,
    },

    /// Show index and configuration status
    Status {
        /// Data folder
        #[arg(long, default_value = "./data")]
        save_path: PathBuf,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest { start, save_path } => cmd_ingest(start, save_path).await,
        Commands::Ask {
            question,
            top_k,
            save_path,
        } => cmd_ask(&question, top_k, save_path).await,
        Commands::Search {
            query,
            limit,
            save_path,
        } => cmd_search(&query, limit, save_path).await,
        Commands::Status { save_path } => cmd_status(save_path).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_ingest(start: Option<String>, save_path: PathBuf) -> Result<()> {
    if !has_api_key() {
        bail!(
            "API key not set.\n\
             Set: export GEMINI_API_KEY=your-api-key"
        );
    }

    let start_date = match start {
        Some(raw) => parse_start_date(&raw)?,
        None => Local::now().date_naive(),
    };

    println!("[*] Ingesting from {} into {:?}", start_date, save_path);

    match run_ingestion(start_date, &save_path).await? {
        IngestOutcome::Indexed(stats) => {
            println!(
                "[OK] Indexed {} units ({} circulars, {} corporate actions)",
                stats.units_indexed, stats.circulars, stats.corporate_actions
            );
            Ok(())
        }
        IngestOutcome::NothingNew => {
            println!("[!] No new updated circulars or data");
            std::process::exit(EXIT_NOTHING_NEW);
        }
    }
}

async fn cmd_ask(question: &str, top_k: usize, save_path: PathBuf) -> Result<()> {
    if !has_api_key() {
        bail!(
            "API key not set.\n\
             Set: export GEMINI_API_KEY=your-api-key"
        );
    }

    let embedder = Arc::new(create_embedder()?);
    let assistant = Assistant::open(&save_path, embedder)
        .await
        .context("failed to open assistant")?;

    println!("[*] Searching: \"{}\"\n", question);

    let mut stream = assistant.stream_answer(question, &[], top_k).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => {
                print!("{}", text);
                stdout.flush().ok();
            }
            Err(e) => {
                // Partial text already printed stays on screen.
                println!();
                return Err(e);
            }
        }
    }
    println!();

    Ok(())
}

async fn cmd_search(query: &str, limit: usize, save_path: PathBuf) -> Result<()> {
    if !has_api_key() {
        bail!(
            "API key not set.\n\
             Set: export GEMINI_API_KEY=your-api-key"
        );
    }

    let embedder = Arc::new(create_embedder()?);
    let retriever = HybridRetriever::open(&save_path, embedder)
        .await
        .context("failed to open retriever")?;

    let results = retriever.search(query, limit).await?;
    if results.is_empty() {
        println!("[!] No results.");
        return Ok(());
    }

    println!("[OK] {} results:\n", results.len());
    for (i, unit) in results.iter().enumerate() {
        let label = match unit.kind {
            crate::index::RecordKind::Circular => format!(
                "{} (page {})",
                unit.document_name, unit.page_number
            ),
            crate::index::RecordKind::CorporateAction => {
                format!("Corporate Action: {}", unit.symbol)
            }
        };
        println!("{}. {}", i + 1, label);
        if !unit.subject.is_empty() {
            println!("   Subject: {}", unit.subject);
        }
        if !unit.display_date.is_empty() {
            println!("   Date: {}", unit.display_date);
        } else if !unit.ex_date.is_empty() {
            println!("   Ex-Date: {}", unit.ex_date);
        }
        println!("   {}", truncate_text(&unit.content, 200));
        println!();
    }

    Ok(())
}

async fn cmd_status(save_path: PathBuf) -> Result<()> {
    println!("nse-circular-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] Data folder: {}", save_path.display());

    if has_api_key() {
        println!("[OK] Embedding API key: set");
    } else {
        println!("[!] Embedding API key: not set");
        println!("    Set: export GEMINI_API_KEY=your-key");
    }

    match LexicalStore::open(&save_path.join("lexical.db")) {
        Ok(store) => match store.count() {
            Ok(count) => println!("[OK] Lexical index: {} units", count),
            Err(e) => println!("[!] Lexical index unreadable: {}", e),
        },
        Err(e) => println!("[!] Lexical index unavailable: {}", e),
    }

    match LanceIndex::open(&save_path.join("vectors.lance")).await {
        Ok(index) => match index.count().await {
            Ok(count) => println!("[OK] Dense index: {} units", count),
            Err(e) => println!("[!] Dense index unreadable: {}", e),
        },
        Err(e) => println!("[!] Dense index unavailable: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse the ingest start date, DD-MM-YYYY.
fn parse_start_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%d-%m-%Y")
        .with_context(|| format!("invalid start date {:?}, expected DD-MM-YYYY", raw))
}

/// UTF-8 safe truncation for display.
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_date() {
        assert_eq!(
            parse_start_date("01-09-2025").unwrap(),
            NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
        );
        assert!(parse_start_date("2025-09-01").is_err());
        assert!(parse_start_date("garbage").is_err());
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }
}
