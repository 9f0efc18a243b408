//! Splits a stream of paragraphs or subtitle cues into token-budgeted chunks.
//!
//! Cut points are chosen in priority order — paragraph break, sentence end,
//! clause punctuation, word boundary — never mid-word. A single unit that
//! exceeds the budget on its own is emitted as one oversized chunk with a
//! logged warning rather than split further, per the chunker's failure mode.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Chunk, ChunkKind, ChunkingConfig};

/// Default abbreviation list used to suppress spurious sentence-boundary
/// matches (single-letter initials and common English titles).
pub fn default_abbreviations() -> Vec<String> {
    [
        "Mr", "Mrs", "Ms", "Dr", "Prof", "Sr", "Jr", "St", "vs", "etc", "e.g", "i.e", "Inc",
        "Ltd", "Co", "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Approximate token count. A byte-pair-style estimate is sufficient per the
/// chunker's stated input contract; exact tokenization is an optimization the
/// core does not need.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    // Roughly 4 bytes/token for Latin scripts, closer to 2 bytes/token for
    // dense multi-byte scripts (CJK, Cyrillic, etc).
    let mut ascii_bytes = 0usize;
    let mut other_bytes = 0usize;
    for b in text.bytes() {
        if b.is_ascii() {
            ascii_bytes += 1;
        } else {
            other_bytes += 1;
        }
    }
    let estimate = (ascii_bytes as f64 / 4.0) + (other_bytes as f64 / 2.0);
    estimate.ceil().max(1.0) as u32
}

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]").unwrap());
static CLAUSE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;:—–]").unwrap());

#[derive(Debug, Clone, Default)]
pub struct ChunkerStats {
    pub total_chunks: usize,
    pub avg_size: f64,
    pub min_size: usize,
    pub max_size: usize,
    /// Fraction of chunks whose estimated token count falls within ±20% of the budget.
    pub within_tolerance_ratio: f64,
    pub oversized_count: usize,
}

pub struct Chunker<'a> {
    config: &'a ChunkingConfig,
}

impl<'a> Chunker<'a> {
    pub fn new(config: &'a ChunkingConfig) -> Self {
        Self { config }
    }

    /// Group `units` (paragraphs for text/EPUB, cues for SRT) into chunks under
    /// the configured token budget, preferring to cut on paragraph boundaries
    /// (between units) and falling back to in-unit sentence/clause/word cuts
    /// only when a single unit alone exceeds the budget.
    pub fn chunk_units(&self, units: &[String], kind: ChunkKind) -> (Vec<Chunk>, ChunkerStats) {
        let budget = self.config.token_budget.max(1);
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0u32;
        let mut oversized_count = 0usize;

        let mut push_current = |current: &mut String, current_tokens: &mut u32| {
            if !current.is_empty() {
                chunks.push(current.trim_end().to_string());
                current.clear();
                *current_tokens = 0;
            }
        };

        for unit in units {
            let unit_tokens = estimate_tokens(unit);

            if unit_tokens > budget {
                // Oversized single unit: flush what we have, then split the unit
                // internally on the best available cut points, still emitting at
                // least one oversized fragment with a warning if it cannot be cut.
                push_current(&mut current, &mut current_tokens);
                let pieces = split_oversized_unit(unit, budget, &self.config.abbreviations);
                if pieces.len() == 1 {
                    oversized_count += 1;
                    tracing::warn!(
                        tokens = unit_tokens,
                        budget,
                        "unit exceeds token budget and has no internal cut point; emitting oversized chunk"
                    );
                }
                for piece in pieces {
                    chunks.push(piece);
                }
                continue;
            }

            if current_tokens + unit_tokens > budget && !current.is_empty() {
                push_current(&mut current, &mut current_tokens);
            }

            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(unit);
            current_tokens += unit_tokens;
        }
        push_current(&mut current, &mut current_tokens);

        let stats = compute_stats(&chunks, budget, oversized_count);
        let built = chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk::new(i as u64, kind, text))
            .collect();
        (built, stats)
    }
}

fn compute_stats(chunks: &[String], budget: u32, oversized_count: usize) -> ChunkerStats {
    if chunks.is_empty() {
        return ChunkerStats::default();
    }
    let sizes: Vec<u32> = chunks.iter().map(|c| estimate_tokens(c)).collect();
    let total: u64 = sizes.iter().map(|&s| s as u64).sum();
    let min_size = *sizes.iter().min().unwrap() as usize;
    let max_size = *sizes.iter().max().unwrap() as usize;
    let lower = (budget as f64 * 0.8) as u32;
    let upper = (budget as f64 * 1.2) as u32;
    let within = sizes.iter().filter(|&&s| s >= lower && s <= upper).count();

    ChunkerStats {
        total_chunks: chunks.len(),
        avg_size: total as f64 / chunks.len() as f64,
        min_size,
        max_size,
        within_tolerance_ratio: within as f64 / chunks.len() as f64,
        oversized_count,
    }
}

/// Split a single oversized unit on the best cut points available, preferring
/// sentence ends over clause punctuation over word boundaries. Never cuts
/// mid-word. Returns a single-element vector (the whole unit) if no internal
/// cut point exists, signaling to the caller that this is an irreducible
/// oversized chunk.
fn split_oversized_unit(unit: &str, budget: u32, abbreviations: &[String]) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = unit;

    while estimate_tokens(remaining) > budget {
        match find_split_point(remaining, budget, abbreviations) {
            Some(pos) if pos > 0 && pos < remaining.len() => {
                pieces.push(remaining[..pos].trim_end().to_string());
                remaining = remaining[pos..].trim_start();
            }
            _ => break,
        }
    }

    if pieces.is_empty() {
        return vec![unit.to_string()];
    }
    if !remaining.is_empty() {
        pieces.push(remaining.to_string());
    }
    pieces
}

/// Single reverse scan for the best cut point under `budget` tokens, tracking
/// the best candidate at each priority level: sentence end > clause
/// punctuation > word boundary.
fn find_split_point(text: &str, budget: u32, abbreviations: &[String]) -> Option<usize> {
    // Estimate a byte offset corresponding to `budget` tokens and scan back
    // from there for a char boundary, then for cut candidates.
    let approx_bytes_per_token = if text.is_ascii() { 4 } else { 2 };
    let mut target = (budget as usize) * approx_bytes_per_token;
    target = target.min(text.len());
    while target > 0 && !text.is_char_boundary(target) {
        target -= 1;
    }
    if target == 0 {
        return None;
    }

    let window = &text[..target];

    let mut best_sentence: Option<usize> = None;
    let mut best_clause: Option<usize> = None;
    let mut best_word: Option<usize> = None;

    for (byte_idx, ch) in window.char_indices() {
        let after = byte_idx + ch.len_utf8();
        if SENTENCE_END.is_match(&ch.to_string()) {
            let next = window[after..].chars().next();
            if next.map(|c| c.is_whitespace()).unwrap_or(true)
                && !is_abbreviation_before(window, byte_idx, abbreviations)
            {
                best_sentence = Some(after);
            }
        } else if CLAUSE_PUNCT.is_match(&ch.to_string()) {
            best_clause = Some(after);
        } else if ch.is_whitespace() {
            best_word = Some(byte_idx);
        }
    }

    best_sentence.or(best_clause).or(best_word)
}

/// Heuristic check: does the token immediately preceding `pos` look like a
/// known abbreviation? Ellipses and embedded quotes are excluded from sentence
/// termination by the caller never treating `…`/`...` as a `SENTENCE_END` match.
fn is_abbreviation_before(text: &str, pos: usize, abbreviations: &[String]) -> bool {
    let preceding = &text[..pos];
    let word = preceding
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    abbreviations.iter().any(|a| a == word)
        || (word.len() == 1 && word.chars().next().is_some_and(|c| c.is_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(budget: u32) -> ChunkingConfig {
        ChunkingConfig {
            token_budget: budget,
            abbreviations: default_abbreviations(),
        }
    }

    #[test]
    fn small_units_merge_into_one_chunk() {
        let config = cfg(1000);
        let chunker = Chunker::new(&config);
        let units = vec!["Hello.".to_string(), "World.".to_string()];
        let (chunks, stats) = chunker.chunk_units(&units, ChunkKind::Text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_text, "Hello.\n\nWorld.");
        assert_eq!(stats.total_chunks, 1);
    }

    #[test]
    fn budget_forces_a_split_between_units() {
        let config = cfg(4);
        let chunker = Chunker::new(&config);
        let units = vec![
            "This is a reasonably long first paragraph of prose.".to_string(),
            "This is a second paragraph that is also fairly long.".to_string(),
        ];
        let (chunks, _) = chunker.chunk_units(&units, ChunkKind::Text);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn oversized_unit_is_emitted_with_warning_when_no_cut_point() {
        let config = cfg(1);
        let chunker = Chunker::new(&config);
        let units = vec!["supercalifragilisticexpialidocious".to_string()];
        let (chunks, stats) = chunker.chunk_units(&units, ChunkKind::Text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(stats.oversized_count, 1);
    }

    #[test]
    fn never_cuts_mid_word() {
        let config = cfg(3);
        let chunker = Chunker::new(&config);
        let units =
            vec!["word1 word2 word3 word4 word5 word6 word7 word8 word9 word10".to_string()];
        let (chunks, _) = chunker.chunk_units(&units, ChunkKind::Text);
        for chunk in &chunks {
            for token in chunk.source_text.split_whitespace() {
                assert!(token.starts_with("word") || token.is_empty());
            }
        }
    }

    #[test]
    fn abbreviation_does_not_split_sentence() {
        let config = cfg(2);
        let chunker = Chunker::new(&config);
        let units = vec!["Dr. Smith arrived early today in the morning sun.".to_string()];
        let (chunks, _) = chunker.chunk_units(&units, ChunkKind::Text);
        assert!(!chunks.iter().any(|c| c.source_text.trim() == "Dr."));
    }

    #[test]
    fn token_estimate_scales_with_script() {
        let ascii = estimate_tokens("hello world");
        let cjk = estimate_tokens("你好世界你好");
        assert!(cjk > 0 && ascii > 0);
    }
}
