//! PDF content-stream interpretation.
//!
//! Walks each page's decoded operator stream and collects positioned words
//! and ruled rectangles. Text positioning tracks the text-line origin through
//! BT/ET, Tm, Td/TD, TL and T*, which is enough to reconstruct reading order
//! and table membership for the layouts circulars actually use; widths are
//! estimated from font size since glyph metrics are not consulted.

use anyhow::{Context, Result};
use lopdf::content::Content;
use lopdf::{Document, Object};

/// Vertical tolerance when grouping words into lines, in user-space units.
pub const LINE_TOLERANCE: f32 = 3.0;

/// Estimated advance per character, as a fraction of the font size.
const CHAR_WIDTH_FACTOR: f32 = 0.5;

// ============================================================================
// Types
// ============================================================================

/// Axis-aligned rectangle in PDF user space (y grows upward).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Whether `word`'s box lies entirely inside this rectangle.
    pub fn contains_word(&self, word: &Word) -> bool {
        word.x0 >= self.x0 && word.x1 <= self.x1 && word.y0 >= self.y0 && word.y1 <= self.y1
    }

    /// Whether the rectangles intersect once both are grown by `tolerance`.
    pub fn touches(&self, other: &Rect, tolerance: f32) -> bool {
        self.x0 - tolerance <= other.x1
            && other.x0 - tolerance <= self.x1
            && self.y0 - tolerance <= other.y1
            && other.y0 - tolerance <= self.y1
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// A word with its estimated bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    pub x0: f32,
    pub x1: f32,
    /// Baseline (lower edge).
    pub y0: f32,
    /// Approximate cap-height edge.
    pub y1: f32,
}

/// Everything the interpreter recovers from one page.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub words: Vec<Word>,
    pub rects: Vec<Rect>,
}

// ============================================================================
// Interpreter
// ============================================================================

/// Interpret every page of `doc`, in page order, returning 1-based page
/// numbers with their recovered content.
pub fn interpret_pages(doc: &Document) -> Result<Vec<(u32, PageContent)>> {
    let mut pages = Vec::new();

    for (page_number, page_id) in doc.get_pages() {
        let content_data = doc
            .get_page_content(page_id)
            .with_context(|| format!("failed to read content of page {}", page_number))?;
        let content = Content::decode(&content_data)
            .with_context(|| format!("failed to decode content stream of page {}", page_number))?;
        pages.push((page_number, interpret_operations(&content)));
    }

    Ok(pages)
}

fn interpret_operations(content: &Content) -> PageContent {
    let mut page = PageContent::default();

    let mut font_size: f32 = 12.0;
    let mut leading: f32 = 12.0;
    // Text-line origin and current show position.
    let mut line_x: f32 = 0.0;
    let mut line_y: f32 = 0.0;
    let mut cur_x: f32 = 0.0;
    let mut cur_y: f32 = 0.0;

    for op in &content.operations {
        match op.operator.as_str() {
            "BT" => {
                line_x = 0.0;
                line_y = 0.0;
                cur_x = 0.0;
                cur_y = 0.0;
            }
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(as_f32) {
                    font_size = size;
                    leading = leading.max(size);
                }
            }
            "TL" => {
                if let Some(l) = op.operands.first().and_then(as_f32) {
                    leading = l;
                }
            }
            "Tm" => {
                if let (Some(e), Some(f)) = (
                    op.operands.get(4).and_then(as_f32),
                    op.operands.get(5).and_then(as_f32),
                ) {
                    line_x = e;
                    line_y = f;
                    cur_x = e;
                    cur_y = f;
                }
            }
            "Td" | "TD" => {
                if let (Some(tx), Some(ty)) = (
                    op.operands.first().and_then(as_f32),
                    op.operands.get(1).and_then(as_f32),
                ) {
                    if op.operator == "TD" {
                        leading = -ty;
                    }
                    line_x += tx;
                    line_y += ty;
                    cur_x = line_x;
                    cur_y = line_y;
                }
            }
            "T*" => {
                line_y -= leading;
                cur_x = line_x;
                cur_y = line_y;
            }
            "Tj" => {
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    if let Some(text) = decode_text_bytes(bytes) {
                        emit_words(&mut page.words, &text, &mut cur_x, cur_y, font_size);
                    }
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        if let Object::String(bytes, _) = item {
                            if let Some(text) = decode_text_bytes(bytes) {
                                emit_words(&mut page.words, &text, &mut cur_x, cur_y, font_size);
                            }
                        }
                    }
                }
            }
            "'" => {
                line_y -= leading;
                cur_x = line_x;
                cur_y = line_y;
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    if let Some(text) = decode_text_bytes(bytes) {
                        emit_words(&mut page.words, &text, &mut cur_x, cur_y, font_size);
                    }
                }
            }
            "\"" => {
                line_y -= leading;
                cur_x = line_x;
                cur_y = line_y;
                if let Some(Object::String(bytes, _)) = op.operands.get(2) {
                    if let Some(text) = decode_text_bytes(bytes) {
                        emit_words(&mut page.words, &text, &mut cur_x, cur_y, font_size);
                    }
                }
            }
            "re" => {
                if let (Some(x), Some(y), Some(w), Some(h)) = (
                    op.operands.first().and_then(as_f32),
                    op.operands.get(1).and_then(as_f32),
                    op.operands.get(2).and_then(as_f32),
                    op.operands.get(3).and_then(as_f32),
                ) {
                    page.rects.push(Rect::new(x, y, x + w, y + h));
                }
            }
            _ => {}
        }
    }

    page
}

/// Split a shown string into whitespace-separated words, assigning each an
/// estimated box and advancing the show position.
fn emit_words(out: &mut Vec<Word>, text: &str, cur_x: &mut f32, cur_y: f32, font_size: f32) {
    let char_w = font_size * CHAR_WIDTH_FACTOR;
    let mut x = *cur_x;

    for piece in text.split_inclusive(char::is_whitespace) {
        let word = piece.trim_end();
        let width = piece.chars().count() as f32 * char_w;
        if !word.is_empty() {
            out.push(Word {
                text: word.to_string(),
                x0: x,
                x1: x + word.chars().count() as f32 * char_w,
                y0: cur_y,
                y1: cur_y + font_size * 0.8,
            });
        }
        x += width;
    }

    *cur_x = x;
}

fn as_f32(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}

/// Decode a PDF string: UTF-16BE with BOM, then UTF-8, then Latin-1 /
/// PDFDocEncoding as the last resort. Control characters are dropped.
pub fn decode_text_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let utf16: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&utf16) {
            let cleaned: String = s.chars().filter(|c| !c.is_control() || *c == ' ').collect();
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
        }
    }

    if let Ok(s) = std::str::from_utf8(bytes) {
        let cleaned: String = s.chars().filter(|c| !c.is_control() || *c == ' ').collect();
        if !cleaned.is_empty() {
            return Some(cleaned);
        }
    }

    let s: String = bytes
        .iter()
        .map(|&b| b as char)
        .filter(|c| !c.is_control() || *c == ' ')
        .collect();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ============================================================================
// Line assembly
// ============================================================================

/// Group words into lines by vertical proximity and join them into text in
/// reading order: lines top-to-bottom, words left-to-right.
pub fn assemble_lines(words: &[Word]) -> String {
    // (baseline, words) buckets; a word joins the first line whose baseline
    // is within the tolerance.
    let mut lines: Vec<(f32, Vec<&Word>)> = Vec::new();

    for word in words {
        match lines
            .iter_mut()
            .find(|(baseline, _)| (*baseline - word.y0).abs() < LINE_TOLERANCE)
        {
            Some((_, members)) => members.push(word),
            None => lines.push((word.y0, vec![word])),
        }
    }

    // Top of page first: descending y in user space.
    lines.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut text = String::new();
    for (_, mut members) in lines {
        members.sort_by(|a, b| a.x0.partial_cmp(&b.x0).unwrap_or(std::cmp::Ordering::Equal));
        let line: Vec<&str> = members.iter().map(|w| w.text.as_str()).collect();
        text.push_str(&line.join(" "));
        text.push('\n');
    }

    text
}

// ============================================================================
// Tests
// ============================================================================
