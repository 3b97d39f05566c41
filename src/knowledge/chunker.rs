use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::tokenizer::{TiktokenTokenizer, Tokenizer};
use super::ID_NAMESPACE;
use crate::config::{
    ChunkingSettings, DEFAULT_CHAR_OVERLAP, DEFAULT_CHAR_WINDOW, DEFAULT_TOKEN_OVERLAP,
    DEFAULT_TOKEN_WINDOW,
};

/// Text chunk produced by the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id derived from source file and index
    pub id: Uuid,
    /// Position within the document, starting at 0
    pub index: usize,
    pub text: String,
    pub source_file: String,
    /// Character (not byte) range of `text` in the source document
    pub char_range: Range<usize>,
}

impl Chunk {
    pub fn new(
        index: usize,
        text: String,
        source_file: impl Into<String>,
        char_range: Range<usize>,
    ) -> Self {
        let source_file = source_file.into();
        Self {
            id: chunk_id(&source_file, index),
            index,
            text,
            source_file,
            char_range,
        }
    }
}

pub fn chunk_id(source_file: &str, index: usize) -> Uuid {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("chunk:{}:{}", source_file, index).as_bytes(),
    )
}

/// Chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkingStrategy {
    /// Sliding window over tokenizer tokens (default)
    Tokens,
    /// Sliding window over characters, used when no tokenizer is available
    Characters,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    size: usize,
    overlap: usize,
}

impl Window {
    fn new(size: usize, overlap: usize) -> Self {
        Self {
            size: size.max(1),
            overlap: overlap.min(size.saturating_sub(1)),
        }
    }

    fn step(&self) -> usize {
        self.size.saturating_sub(self.overlap).max(1)
    }
}

/// Overlapping window chunker with boundary cleanup.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Option<Arc<dyn Tokenizer>>,
    token_window: Window,
    char_window: Window,
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker")
            .field("strategy", &self.strategy())
            .field(
                "tokenizer",
                &self.tokenizer.as_ref().map(|t| t.name().to_string()),
            )
            .field("token_window", &self.token_window)
            .field("char_window", &self.char_window)
            .finish()
    }
}

impl Chunker {
    /// Token windows when `cl100k_base` loads, character windows otherwise.
    pub fn from_settings(settings: &ChunkingSettings) -> Self {
        let mut chunker = Self::characters(settings.char_window, settings.char_overlap);
        if settings.use_tokenizer {
            match TiktokenTokenizer::for_embeddings() {
                Ok(tokenizer) => {
                    chunker.tokenizer = Some(Arc::new(tokenizer));
                    chunker.token_window =
                        Window::new(settings.token_window, settings.token_overlap);
                }
                Err(err) => warn!("Tokenizer unavailable, using character windows: {}", err),
            }
        }
        chunker
    }

    /// Character-window chunker.
    pub fn characters(size: usize, overlap: usize) -> Self {
        Self {
            tokenizer: None,
            token_window: Window::new(DEFAULT_TOKEN_WINDOW, DEFAULT_TOKEN_OVERLAP),
            char_window: Window::new(size, overlap),
        }
    }

    /// Token-window chunker with a custom tokenizer.
    pub fn with_tokenizer(tokenizer: Arc<dyn Tokenizer>, size: usize, overlap: usize) -> Self {
        Self {
            tokenizer: Some(tokenizer),
            token_window: Window::new(size, overlap),
            char_window: Window::new(DEFAULT_CHAR_WINDOW, DEFAULT_CHAR_OVERLAP),
        }
    }

    pub fn strategy(&self) -> ChunkingStrategy {
        if self.tokenizer.is_some() {
            ChunkingStrategy::Tokens
        } else {
            ChunkingStrategy::Characters
        }
    }

    /// Split text into ordered, overlapping chunks.
    ///
    /// Whitespace-only text yields no chunks; text shorter than one window yields
    /// exactly one.
    pub fn chunk(&self, text: &str, source_file: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let token_boundaries = self
            .tokenizer
            .as_ref()
            .and_then(|tokenizer| match tokenizer.token_offsets(text) {
                Some(offsets) => Some(offsets),
                None => {
                    warn!(
                        "Tokenizer {} could not map offsets for {}, using character windows",
                        tokenizer.name(),
                        source_file
                    );
                    None
                }
            });

        let ranges = match token_boundaries {
            Some(boundaries) => split_windows(text, &boundaries, self.token_window),
            None => {
                let boundaries: Vec<usize> = text
                    .char_indices()
                    .map(|(i, _)| i)
                    .chain(std::iter::once(text.len()))
                    .collect();
                split_windows(text, &boundaries, self.char_window)
            }
        };

        let mut chunks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let slice = &text[range.clone()];
            let trimmed = slice.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lead = slice.len() - slice.trim_start().len();
            let byte_start = range.start + lead;
            let char_start = text[..byte_start].chars().count();
            let char_end = char_start + trimmed.chars().count();

            chunks.push(Chunk::new(
                chunks.len(),
                trimmed.to_string(),
                source_file,
                char_start..char_end,
            ));
        }

        debug!(
            "Chunked {} into {} chunks ({:?})",
            source_file,
            chunks.len(),
            self.strategy()
        );
        chunks
    }
}

/// Slide `window` over unit `boundaries` (byte offsets, `n + 1` entries) and clean
/// each window's edges. Cleanup never moves an edge past its neighbor's, so the
/// returned byte ranges still cover the text without gaps.
fn split_windows(text: &str, boundaries: &[usize], window: Window) -> Vec<Range<usize>> {
    let units = boundaries.len().saturating_sub(1);
    if units == 0 {
        return Vec::new();
    }

    let step = window.step();
    let mut ranges = Vec::new();
    let mut start_unit = 0;
    let mut prev_end = 0;

    loop {
        let end_unit = (start_unit + window.size).min(units);
        let raw_start = boundaries[start_unit];
        let raw_end = boundaries[end_unit];

        let start = if start_unit > 0 {
            trim_partial_word(text, raw_start, raw_end, prev_end)
        } else {
            raw_start
        };
        let end = if end_unit < units {
            let next_start = boundaries[(start_unit + step).min(units)];
            cut_partial_sentence(text, start, raw_end, next_start)
        } else {
            raw_end
        };

        if start < end {
            ranges.push(start..end);
            prev_end = end;
        }

        if end_unit == units {
            break;
        }
        start_unit += step;
    }

    ranges
}

/// Skip a word cut in half by the window start, but not past `limit`.
fn trim_partial_word(text: &str, start: usize, end: usize, limit: usize) -> usize {
    let before = text[..start].chars().next_back();
    let at = text[start..].chars().next();
    let mid_word = matches!((before, at), (Some(b), Some(a)) if !b.is_whitespace() && !a.is_whitespace());
    if !mid_word {
        return start;
    }

    match text[start..end].find(char::is_whitespace) {
        Some(pos) if start + pos <= limit && start + pos < end => start + pos,
        _ => start,
    }
}

/// End the window after its last complete sentence, as long as the cut stays at or
/// beyond `min_cut` (where the next window begins).
fn cut_partial_sentence(text: &str, start: usize, end: usize, min_cut: usize) -> usize {
    let is_terminator = |c: char| matches!(c, '.' | '!' | '?');

    let slice = &text[start..end];
    if slice.chars().next_back().is_some_and(is_terminator)
        && text[end..].chars().next().is_some_and(char::is_whitespace)
    {
        return end;
    }

    let mut last_cut = None;
    let mut chars = slice.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if is_terminator(c) && chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
            last_cut = Some(start + i + c.len_utf8());
        }
    }

    match last_cut {
        Some(cut) if cut >= min_cut && cut > start => cut,
        _ => end,
    }
}
