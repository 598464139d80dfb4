//! nse-circular-rag - RAG pipeline over NSE circulars
//!
//! Scrapes circulars and corporate actions from the exchange API, extracts
//! text and tables from PDF/ZIP attachments, indexes per-page units into a
//! hybrid store (LanceDB dense + SQLite FTS5 lexical), and answers
//! questions by two-stage retrieval with streamed generation.

pub mod cli;
pub mod dates;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod index;
pub mod pipeline;
pub mod query;
pub mod rag;
pub mod source;

// Re-exports
pub use dates::{DateFilter, resolve as resolve_date_filter};
pub use embedding::{EmbeddingProvider, GeminiEmbedding, get_api_key, has_api_key};
pub use error::PipelineError;
pub use extractor::{Document, Page, PdfExtractor, RecordMeta, Table};
pub use index::{
    IndexUnit, IndexWriter, LanceIndex, LexicalStore, RecordKind, RetrievedUnit,
};
pub use pipeline::{run_ingestion, IngestOutcome, IngestStats};
pub use query::HybridRetriever;
pub use rag::{Assistant, ChatClient, ChatMessage, REFUSAL_PHRASE};
pub use source::records::{CircularRecord, CorporateActionRecord};
pub use source::sync::{FetchWindow, SyncState, SyncTracker};
pub use source::CircularSource;
