//! Token encoding used by the token-window chunker.
//!
//! Wraps tiktoken's `cl100k_base` encoding, which matches the OpenAI embedding
//! models, behind a small trait so the chunker can be driven by other tokenizers
//! in tests.

use crate::error::{Error, Result};

/// Tokenization operations needed by the chunker.
pub trait Tokenizer: Send + Sync {
    /// Count the number of tokens in the given text.
    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Encode text into token IDs.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token IDs back into text. Returns an empty string when the tokens
    /// do not form valid UTF-8 on their own (e.g. half of a multi-byte char).
    fn decode(&self, tokens: &[u32]) -> String;

    /// Get the name/identifier of this tokenizer.
    fn name(&self) -> &str;

    /// Byte offset of every token boundary in `text`, `n + 1` entries for `n` tokens.
    ///
    /// Tokens that only decode together (a character split over several byte-level
    /// tokens) share one boundary, so a window cut never lands inside a character.
    /// Returns `None` if the decoded pieces do not reproduce `text`.
    fn token_offsets(&self, text: &str) -> Option<Vec<usize>> {
        let tokens = self.encode(text);
        let mut offsets = Vec::with_capacity(tokens.len() + 1);
        let mut group_start = 0usize;
        let mut pending_from = 0usize;

        offsets.push(0);
        for i in 0..tokens.len() {
            let piece = self.decode(&tokens[pending_from..=i]);
            if piece.is_empty() {
                // Incomplete UTF-8 sequence: keep accumulating.
                offsets.push(group_start);
                continue;
            }
            if !text.get(group_start..)?.starts_with(piece.as_str()) {
                return None;
            }
            group_start += piece.len();
            offsets.push(group_start);
            pending_from = i + 1;
        }

        if group_start != text.len() {
            return None;
        }
        Some(offsets)
    }
}

/// Tiktoken-based tokenizer implementation.
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
    name: String,
}

impl TiktokenTokenizer {
    /// Create a tokenizer for embeddings (uses cl100k_base).
    pub fn for_embeddings() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| {
            Error::ConfigError(format!("Failed to initialize cl100k_base: {}", e))
        })?;

        Ok(Self {
            bpe,
            name: "cl100k_base".to_string(),
        })
    }
}

impl std::fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenTokenizer")
            .field("name", &self.name)
            .finish()
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let token_vec: Vec<usize> = tokens.iter().map(|&t| t as usize).collect();
        self.bpe.decode(token_vec).unwrap_or_default()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_ENGLISH: &str = "The quick brown fox jumps over the lazy dog.";

    /// One token per whitespace-separated word, whitespace attached to the word.
    struct WordTokenizer {
        vocab: std::sync::Mutex<Vec<String>>,
    }

    impl WordTokenizer {
        fn new() -> Self {
            Self {
                vocab: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl Tokenizer for WordTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            let mut vocab = self.vocab.lock().unwrap();
            text.split_inclusive(' ')
                .map(|piece| {
                    vocab.push(piece.to_string());
                    (vocab.len() - 1) as u32
                })
                .collect()
        }

        fn decode(&self, tokens: &[u32]) -> String {
            let vocab = self.vocab.lock().unwrap();
            tokens.iter().map(|&t| vocab[t as usize].as_str()).collect()
        }

        fn name(&self) -> &str {
            "words"
        }
    }

    #[test]
    fn test_tiktoken_for_embeddings_initialization() {
        let tokenizer = TiktokenTokenizer::for_embeddings().unwrap();
        assert_eq!(tokenizer.name(), "cl100k_base");
    }

    #[test]
    fn test_tiktoken_encode_decode() {
        let tokenizer = TiktokenTokenizer::for_embeddings().unwrap();
        let tokens = tokenizer.encode(SIMPLE_ENGLISH);
        assert!(!tokens.is_empty());
        assert_eq!(tokenizer.decode(&tokens), SIMPLE_ENGLISH);
        assert_eq!(tokenizer.count_tokens(SIMPLE_ENGLISH), tokens.len());
    }

    #[test]
    fn test_token_offsets_cover_text() {
        let tokenizer = TiktokenTokenizer::for_embeddings().unwrap();
        let offsets = tokenizer.token_offsets(SIMPLE_ENGLISH).unwrap();

        assert_eq!(offsets.len(), tokenizer.count_tokens(SIMPLE_ENGLISH) + 1);
        assert_eq!(offsets[0], 0);
        assert_eq!(*offsets.last().unwrap(), SIMPLE_ENGLISH.len());
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_token_offsets_land_on_char_boundaries() {
        let tokenizer = TiktokenTokenizer::for_embeddings().unwrap();
        let text = "Выручка выросла на 12% 📈 в третьем квартале";
        let offsets = tokenizer.token_offsets(text).unwrap();

        for offset in offsets {
            assert!(text.is_char_boundary(offset));
        }
    }

    #[test]
    fn test_default_offsets_with_custom_tokenizer() {
        let tokenizer = WordTokenizer::new();
        let offsets = tokenizer.token_offsets("one two three").unwrap();
        assert_eq!(offsets, vec![0, 4, 8, 13]);
    }

    #[test]
    fn test_token_offsets_empty_text() {
        let tokenizer = WordTokenizer::new();
        assert_eq!(tokenizer.token_offsets("").unwrap(), vec![0]);
    }
}
