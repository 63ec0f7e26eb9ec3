//! Splitting document text into index nodes.
//!
//! Chunk boundaries come from `semchunk-rs`; token counts come from the `cl100k_base` BPE when it
//! loads and from whitespace counting otherwise. Overlap is applied afterwards by prefixing each
//! chunk with trailing words of its predecessor, never exceeding the chunk budget.

use semchunk_rs::Chunker;
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::cl100k_base;

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Errors produced while configuring the splitter.
#[derive(Debug, Error)]
pub enum SplitError {
    /// A zero token budget cannot hold any text.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Token-budgeted node splitter.
#[derive(Clone)]
pub struct NodeSplitter {
    chunk_size: usize,
    overlap: usize,
    counter: TokenCounter,
}

impl NodeSplitter {
    /// Splitter counting BPE tokens, or whitespace tokens when the encoding is unavailable.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, SplitError> {
        let counter: TokenCounter = match cl100k_base() {
            Ok(encoding) => {
                let encoding = Arc::new(encoding);
                Arc::new(move |segment: &str| encoding.encode_ordinary(segment).len())
            }
            Err(error) => {
                tracing::warn!(error = %error, "BPE tokenizer unavailable; counting whitespace tokens");
                whitespace_counter()
            }
        };
        Self::with_counter(chunk_size, overlap, counter)
    }

    /// Splitter counting whitespace-separated words.
    pub fn whitespace(chunk_size: usize, overlap: usize) -> Result<Self, SplitError> {
        Self::with_counter(chunk_size, overlap, whitespace_counter())
    }

    fn with_counter(
        chunk_size: usize,
        overlap: usize,
        counter: TokenCounter,
    ) -> Result<Self, SplitError> {
        if chunk_size == 0 {
            return Err(SplitError::InvalidChunkSize);
        }
        Ok(Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
            counter,
        })
    }

    /// Split `text` into chunks of at most `chunk_size` tokens; empty for blank input.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let counter = self.counter.clone();
        let chunker = Chunker::new(
            self.chunk_size,
            Box::new(move |segment: &str| counter.as_ref()(segment)),
        );
        let chunks: Vec<String> = chunker
            .chunk(text)
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();
        self.overlap_chunks(chunks)
    }

    fn count(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    fn overlap_chunks(&self, chunks: Vec<String>) -> Vec<String> {
        if self.overlap == 0 || chunks.len() < 2 {
            return chunks;
        }
        let mut result = Vec::with_capacity(chunks.len());
        result.push(chunks[0].clone());
        for pair in chunks.windows(2) {
            result.push(self.with_overlap(&pair[0], &pair[1]));
        }
        result
    }

    /// Prefix `chunk` with the longest tail of `previous` that keeps it within budget.
    fn with_overlap(&self, previous: &str, chunk: &str) -> String {
        let room = self
            .chunk_size
            .saturating_sub(self.count(chunk))
            .min(self.overlap);
        if room == 0 {
            return chunk.to_string();
        }

        let words = word_spans(previous);
        let mut used = 0;
        let mut taken = 0;
        for word in words.iter().rev() {
            let tokens = self.count(&previous[word.clone()]);
            if used + tokens > room {
                break;
            }
            used += tokens;
            taken += 1;
        }

        // Per-word counts can undershoot the joined count, so confirm before accepting.
        for word in &words[words.len() - taken..] {
            let merged = format!("{} {}", previous[word.start..].trim_end(), chunk);
            if self.count(&merged) <= self.chunk_size {
                return merged;
            }
        }
        chunk.to_string()
    }
}

/// Byte ranges of the whitespace-separated words in `text`.
fn word_spans(text: &str) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(begin)) => {
                spans.push(begin..idx);
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(begin) = start {
        spans.push(begin..text.len());
    }
    spans
}

fn whitespace_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_within_budget() {
        let splitter = NodeSplitter::whitespace(2, 0).expect("splitter");
        assert_eq!(
            splitter.split("one two three four five"),
            vec!["one two", "three four", "five"]
        );
    }

    #[test]
    fn blank_text_yields_no_nodes() {
        let splitter = NodeSplitter::whitespace(4, 0).expect("splitter");
        assert!(splitter.split("   \n\t").is_empty());
    }

    #[test]
    fn overlap_carries_trailing_words() {
        let splitter = NodeSplitter::whitespace(4, 1).expect("splitter");
        let chunks = splitter.split("one two three four five six");
        assert_eq!(chunks, vec!["one two three four", "four five six"]);
    }

    #[test]
    fn overlap_yields_to_a_full_chunk() {
        let splitter = NodeSplitter::whitespace(3, 1).expect("splitter");
        let chunks = splitter.split("one two three four five six");
        assert_eq!(chunks, vec!["one two three", "four five six"]);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            NodeSplitter::whitespace(0, 0),
            Err(SplitError::InvalidChunkSize)
        ));
    }

    #[test]
    fn overlap_keeps_line_breaks_of_the_previous_chunk() {
        let splitter = NodeSplitter::whitespace(6, 3).expect("splitter");
        let chunks = splitter.overlap_chunks(vec!["one\ntwo\nthree".into(), "four five".into()]);
        assert_eq!(chunks[1], "one\ntwo\nthree four five");
    }

    #[test]
    fn overlap_counts_each_word_once() {
        let encoded = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let tally = encoded.clone();
        let counter: TokenCounter = Arc::new(move |segment: &str| {
            tally.fetch_add(segment.len(), std::sync::atomic::Ordering::SeqCst);
            segment.split_whitespace().count()
        });
        let splitter = NodeSplitter::with_counter(400, 150, counter).expect("splitter");
        let previous = (0..300).map(|idx| format!("w{idx}")).collect::<Vec<_>>().join(" ");
        let next = "closing words".to_string();

        let chunks = splitter.overlap_chunks(vec![previous.clone(), next.clone()]);
        assert_eq!(chunks[1].split_whitespace().count(), 152);

        let budget = 4 * (previous.len() + next.len());
        assert!(
            encoded.load(std::sync::atomic::Ordering::SeqCst) < budget,
            "overlap re-encoded the previous chunk repeatedly"
        );
    }

    #[test]
    fn bpe_splitter_respects_token_budget() {
        let splitter = NodeSplitter::new(8, 2).expect("splitter");
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(6);
        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(splitter.count(chunk) <= 8, "chunk over budget: {chunk:?}");
        }
    }
}
