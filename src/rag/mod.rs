//! Context assembly and streamed answer generation.
//!
//! Groups retrieved units into labeled context blocks, wraps them in the
//! instruction template, and streams the completion from an
//! OpenAI-compatible endpoint. The stream stops consuming as soon as the
//! model has fully emitted the fixed refusal phrase; there is no point
//! paying for tokens after "no answer".

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::index::{RecordKind, RetrievedUnit};
use crate::query::HybridRetriever;

/// Exact refusal string the prompt mandates when the context has no answer.
pub const REFUSAL_PHRASE: &str = "The provided circulars do not contain this information.";

/// How many trailing conversation messages accompany a query.
const HISTORY_TAIL: usize = 4;

/// Default generation model.
const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";

/// A chat turn in OpenAI message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

// ============================================================================
// Context assembly
// ============================================================================

/// Render retrieved units into labeled context blocks: one block per
/// document (or corporate action), metadata once, then page content in the
/// order retrieval produced it.
pub fn build_context(results: &[RetrievedUnit]) -> String {
    // Group by label, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&RetrievedUnit>> = HashMap::new();

    for unit in results {
        let label = match unit.kind {
            RecordKind::Circular => unit.document_name.clone(),
            RecordKind::CorporateAction => format!("Corporate Action: {}", unit.symbol),
        };
        if !groups.contains_key(&label) {
            order.push(label.clone());
        }
        groups.entry(label).or_default().push(unit);
    }

    let mut context = String::new();
    for (idx, label) in order.iter().enumerate() {
        let units = &groups[label];
        let first = units[0];

        match first.kind {
            RecordKind::Circular => {
                context.push_str(&format!("=== CIRCULAR {}: {} ===\n\n", idx + 1, label));
                push_field(&mut context, "Subject", &first.subject);
                push_field(&mut context, "Date", &first.display_date);
                push_field(&mut context, "File Link", &first.file_link);
                push_field(&mut context, "Department", &first.department);
                push_field(&mut context, "Category", &first.category);
            }
            RecordKind::CorporateAction => {
                context.push_str(&format!("=== {} ===\n\n", label));
                push_field(&mut context, "Symbol", &first.symbol);
                push_field(&mut context, "Company", &first.company);
                push_field(&mut context, "Series", &first.series);
                push_field(&mut context, "Face Value", &first.face_value);
                push_field(&mut context, "Subject", &first.subject);
                push_field(&mut context, "Ex-Date", &first.ex_date);
            }
        }

        context.push_str("\nContent:\n");
        for unit in units {
            if unit.content.trim().is_empty() {
                continue;
            }
            if units.len() > 1 {
                context.push_str(&format!("\n[Page {}]\n", unit.page_number));
            }
            context.push_str(unit.content.trim());
            context.push('\n');
        }

        context.push_str(&format!("\n{}\n\n", "=".repeat(60)));
    }

    context
}

fn push_field(out: &mut String, name: &str, value: &str) {
    if !value.is_empty() {
        out.push_str(&format!("{}: {}\n", name, value));
    }
}

/// Compose the full generation prompt: context-only answering, no
/// meta-references, fixed refusal string.
pub fn build_prompt(query: &str, results: &[RetrievedUnit]) -> String {
    let context = build_context(results);

    format!(
        r#"You are an expert assistant specializing in NSE (National Stock Exchange of India) circulars.

### INSTRUCTIONS
- Answer using ONLY the information from the circular excerpts provided below.
- Provide answers in a direct, natural conversational style as if the information is your own knowledge.
- Do NOT mention document names, circular numbers, excerpts, or references in your response body.
- Do NOT use phrases like "based on the provided circulars", "according to the documents", "CIRCULAR X states", or similar meta-references.
- If multiple excerpts are from the same source, combine them coherently without citing the source.
- When data is comparative or structured, use markdown tables for better readability.
- Extract and present only relevant information. Reproduce full tables only when necessary for clarity.
- Use the most recent information when there are conflicting details across different circulars.
- Maintain a factual, neutral tone and speak authoritatively about the information.

### CLASSIFICATION GUIDELINES
- Non-Business Days refer ONLY to calendar dates or days when markets/operations are closed
- Securities, funds, and financial instruments are NEVER categories of days
- When answering questions about business days, focus exclusively on temporal information
- Distinguish between: (1) What is being discussed (e.g., mutual funds), and (2) When it applies (e.g., business days)

### STRICT RULES
1. Do NOT use external knowledge or make assumptions beyond what's provided.
2. Do NOT modify stock symbols, index names, or any codes - use them exactly as written.
3. Do NOT invent data or speculate.
4. If URLs are mentioned in the content, output them as plain text (no markdown/HTML formatting).
5. Avoid repeating the same information multiple times.
6. NEVER reference the document structure, excerpt numbers, or circular labels in your answer.
7. Write as if you naturally know this information - do not mention your sources.
8. If NO relevant information is found in the provided context after thorough review, respond with EXACTLY: "{refusal}"
9. Otherwise, provide a direct answer without any meta-commentary about where the information came from.

### CONTEXT
{context}

### QUESTION
{query}

### ANSWER"#,
        refusal = REFUSAL_PHRASE,
        context = context,
        query = query,
    )
}

/// Bounded history tail plus the synthesized user message.
pub fn build_messages(history: &[ChatMessage], prompt: String) -> Vec<ChatMessage> {
    let tail_start = history.len().saturating_sub(HISTORY_TAIL);
    let mut messages: Vec<ChatMessage> = history[tail_start..].to_vec();
    messages.push(ChatMessage::user(prompt));
    messages
}

// ============================================================================
// Chat client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed server-sent-events line.
#[derive(Debug, PartialEq)]
enum SseData {
    /// Text delta to yield.
    Delta(String),
    /// `[DONE]` sentinel.
    Done,
    /// Comment, keep-alive, empty delta - nothing to emit.
    Skip,
}

fn parse_sse_line(line: &str) -> SseData {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseData::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseData::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseData::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            if text.is_empty() {
                SseData::Skip
            } else {
                SseData::Delta(text)
            }
        }
        Err(_) => SseData::Skip,
    }
}

/// OpenAI-compatible streaming chat-completions client. Provider selection
/// follows the configured keys: `OPENAI_API_KEY` routes through OpenRouter,
/// else `GEMINI_API_KEY` uses Gemini's OpenAI-compatible endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    pub fn from_env() -> Result<Self> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                tracing::debug!("using OpenRouter for generation");
                return Self::new(
                    "https://openrouter.ai/api/v1".to_string(),
                    key,
                    DEFAULT_MODEL.to_string(),
                );
            }
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                tracing::debug!("using Gemini OpenAI-compatible endpoint for generation");
                return Self::new(
                    "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
                    key,
                    DEFAULT_MODEL.to_string(),
                );
            }
        }
        anyhow::bail!(
            "No generation API key found. Set OPENAI_API_KEY or GEMINI_API_KEY."
        )
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Open a streaming completion and yield text deltas as they arrive.
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::GenerationStream(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(PipelineError::GenerationStream(
                format!("HTTP {}: {}", status, body),
            )));
        }

        let bytes = response.bytes_stream().boxed();
        let deltas = futures::stream::unfold(
            (bytes, String::new(), false),
            |(mut bytes, mut buffer, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        match parse_sse_line(&line) {
                            SseData::Delta(text) => {
                                return Some((Ok(text), (bytes, buffer, false)))
                            }
                            SseData::Done => return None,
                            SseData::Skip => continue,
                        }
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            // Yield the transport failure, then end.
                            let err = anyhow::Error::new(PipelineError::GenerationStream(
                                e.to_string(),
                            ));
                            return Some((Err(err), (bytes, buffer, true)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(deltas.boxed())
    }
}

// ============================================================================
// Refusal early-stop
// ============================================================================

/// Pass chunks through until the accumulated output contains the refusal
/// phrase, then end the stream: the model has already said "no answer".
pub fn stop_after_refusal(
    inner: BoxStream<'static, Result<String>>,
) -> BoxStream<'static, Result<String>> {
    futures::stream::unfold(
        (inner, String::new(), false),
        |(mut inner, mut accumulated, done)| async move {
            if done {
                return None;
            }
            match inner.next().await {
                Some(Ok(chunk)) => {
                    accumulated.push_str(&chunk);
                    let stop = accumulated.contains(REFUSAL_PHRASE);
                    Some((Ok(chunk), (inner, accumulated, stop)))
                }
                Some(Err(e)) => Some((Err(e), (inner, accumulated, true))),
                None => None,
            }
        },
    )
    .boxed()
}

// ============================================================================
// Assistant
// ============================================================================

/// Retrieval-augmented answering facade for the chat UI collaborator.
pub struct Assistant {
    retriever: HybridRetriever,
    chat: ChatClient,
}

impl Assistant {
    pub async fn open(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let retriever = HybridRetriever::open(data_dir, embedder).await?;
        let chat = ChatClient::from_env()?;
        Ok(Self { retriever, chat })
    }

    pub fn with_chat_client(retriever: HybridRetriever, chat: ChatClient) -> Self {
        Self { retriever, chat }
    }

    /// Retrieval -> context -> streamed generation. The returned stream
    /// yields text chunks and halts right after a complete refusal phrase.
    pub async fn stream_answer(
        &self,
        query: &str,
        history: &[ChatMessage],
        top_k: usize,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let results = self.retriever.search(query, top_k).await?;
        tracing::debug!("retrieved {} units for query", results.len());

        let prompt = build_prompt(query, &results);
        let messages = build_messages(history, prompt);
        let deltas = self.chat.stream_chat(messages).await?;
        Ok(stop_after_refusal(deltas))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn circular_unit(doc: &str, page: i32, content: &str) -> RetrievedUnit {
        RetrievedUnit {
            unit_id: format!("{}-{}", doc, page),
            record_id: doc.to_string(),
            kind: RecordKind::Circular,
            department: "Surveillance".to_string(),
            category: "Trading".to_string(),
            subject: "Revision of margins".to_string(),
            file_link: format!("https://archives.example.com/{}", doc),
            display_date: "2025-09-25T00:00:00".to_string(),
            ex_date: String::new(),
            symbol: String::new(),
            series: String::new(),
            face_value: String::new(),
            company: String::new(),
            document_name: doc.to_string(),
            page_number: page,
            content: content.to_string(),
            distance: 0.0,
        }
    }

    fn action_unit(symbol: &str) -> RetrievedUnit {
        RetrievedUnit {
            unit_id: format!("ca-{}", symbol),
            record_id: format!("ca-{}", symbol),
            kind: RecordKind::CorporateAction,
            department: String::new(),
            category: String::new(),
            subject: "Dividend - Rs 2 Per Share".to_string(),
            file_link: String::new(),
            display_date: String::new(),
            ex_date: "2025-09-29T00:00:00".to_string(),
            symbol: symbol.to_string(),
            series: "EQ".to_string(),
            face_value: "10".to_string(),
            company: format!("{} Limited", symbol),
            document_name: String::new(),
            page_number: 0,
            content: format!("{} dividend", symbol),
            distance: 0.0,
        }
    }

    #[test]
    fn test_build_context_groups_by_document() {
        let results = vec![
            action_unit("ABC"),
            circular_unit("CIR_1.pdf", 1, "First page body"),
            circular_unit("CIR_1.pdf", 2, "Second page body"),
            circular_unit("CIR_2.pdf", 1, "Other circular"),
        ];

        let context = build_context(&results);

        assert!(context.contains("=== Corporate Action: ABC ==="));
        assert!(context.contains("=== CIRCULAR 2: CIR_1.pdf ==="));
        assert!(context.contains("=== CIRCULAR 3: CIR_2.pdf ==="));
        // Multi-page groups carry page markers; single-page groups do not.
        assert!(context.contains("[Page 1]"));
        assert!(context.contains("[Page 2]"));
        assert!(context.contains("Subject: Revision of margins"));
        assert!(context.contains("Ex-Date: 2025-09-29T00:00:00"));
        assert!(context.contains(&"=".repeat(60)));
        // CIR_1 block appears once with both pages inside.
        assert_eq!(context.matches("CIR_1.pdf ===").count(), 1);
    }

    #[test]
    fn test_build_prompt_embeds_query_and_refusal() {
        let results = vec![circular_unit("CIR_1.pdf", 1, "Body text")];
        let prompt = build_prompt("What changed in margins?", &results);

        assert!(prompt.contains("### CONTEXT"));
        assert!(prompt.contains("Body text"));
        assert!(prompt.contains("### QUESTION\nWhat changed in margins?"));
        assert!(prompt.contains(REFUSAL_PHRASE));
    }

    #[test]
    fn test_build_messages_bounds_history() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("q{}", i))
                } else {
                    ChatMessage::assistant(format!("a{}", i))
                }
            })
            .collect();

        let messages = build_messages(&history, "prompt".to_string());
        // Last 4 turns plus the synthesized user message.
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, "q6");
        assert_eq!(messages[4].content, "prompt");
        assert_eq!(messages[4].role, "user");
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(parse_sse_line(""), SseData::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseData::Skip);
        assert_eq!(parse_sse_line("data: [DONE]"), SseData::Done);

        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_line(line), SseData::Delta("Hello".to_string()));

        // Role-only delta carries no text.
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseData::Skip);
    }

    #[tokio::test]
    async fn test_stream_halts_after_refusal_phrase() {
        // The refusal arrives split across chunks; chunks after it must not
        // be consumed.
        let chunks: Vec<Result<String>> = vec![
            Ok("The provided circulars ".to_string()),
            Ok("do not contain ".to_string()),
            Ok("this information.".to_string()),
            Ok(" SHOULD NEVER APPEAR".to_string()),
        ];
        let inner = stream::iter(chunks).boxed();

        let collected: Vec<Result<String>> = stop_after_refusal(inner).collect().await;
        let text: String = collected.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(text, REFUSAL_PHRASE);
    }

    #[tokio::test]
    async fn test_stream_passes_normal_answers_through() {
        let chunks: Vec<Result<String>> = vec![
            Ok("The settlement ".to_string()),
            Ok("calendar is unchanged.".to_string()),
        ];
        let inner = stream::iter(chunks).boxed();

        let collected: Vec<Result<String>> = stop_after_refusal(inner).collect().await;
        let text: String = collected.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(text, "The settlement calendar is unchanged.");
    }
}
