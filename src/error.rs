//! Pipeline error taxonomy.
//!
//! Most fallible paths use `anyhow::Result` with context; the variants here
//! exist for the seams where callers must tell failure modes apart
//! (scheduler, chat UI). "No new data" is not an error; see
//! [`crate::pipeline::IngestOutcome`].

use thiserror::Error;

/// Errors the ingestion/retrieval pipeline surfaces to its callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Remote circular/corporate-action API unreachable or malformed envelope.
    /// Not retried by the core; the caller may re-run the cycle later.
    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    /// Per-attachment download failure (network or non-200). Contained: the
    /// record is kept and indexed metadata-only if retries do not recover it.
    #[error("attachment download failed for {link}: {reason}")]
    AttachmentDownload { link: String, reason: String },

    /// PDF could not be opened or parsed. Contained: the affected document's
    /// pages are omitted, the record is retained.
    #[error("extraction failed for {filename}: {reason}")]
    Extraction { filename: String, reason: String },

    /// Neither circular nor corporate-action units were produced. Fatal for
    /// the run: there is nothing meaningful to persist.
    #[error("no index units produced from the corpus")]
    IndexBuild,

    /// Vector-store query failure, surfaced as a failed answer attempt.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The completion endpoint failed mid-stream. Text already yielded is
    /// preserved by the caller.
    #[error("generation stream failed: {0}")]
    GenerationStream(String),
}
