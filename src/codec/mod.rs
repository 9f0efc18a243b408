//! Format-specific document codecs: parse an input artifact into translation
//! units the Chunker can group, and reassemble translated chunk text back
//! into the output artifact.
//!
//! The codecs never see chunk boundaries: the Chunker may merge several
//! units into one chunk or split an oversized one, so reassembly reverses
//! the same `"\n\n"`-join convention the Chunker uses to pack units rather
//! than threading chunk-to-unit bookkeeping through the orchestrator.

pub mod epub;
pub mod srt;
pub mod text;

use std::path::Path;

use crate::error::Result;
use crate::model::ChunkKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Epub,
    Srt,
}

impl DocumentFormat {
    /// Infer from the input path's extension; anything unrecognized is
    /// treated as plain text.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("epub") => DocumentFormat::Epub,
            Some("srt") => DocumentFormat::Srt,
            _ => DocumentFormat::Text,
        }
    }
}

/// Intermediate representation the orchestrator chunks and, after
/// translation, reassembles.
pub struct ParsedDocument {
    pub units: Vec<String>,
    pub origin: DocumentOrigin,
}

pub enum DocumentOrigin {
    Text,
    Epub(epub::EpubDocument),
    Srt(Vec<srt::Cue>),
}

impl DocumentOrigin {
    pub fn chunk_kind(&self) -> ChunkKind {
        match self {
            DocumentOrigin::Text => ChunkKind::Text,
            DocumentOrigin::Epub(_) => ChunkKind::EpubFragment,
            DocumentOrigin::Srt(_) => ChunkKind::SrtBatch,
        }
    }
}

/// Parse `input_path` per its detected format into translation units.
pub fn read(input_path: &Path) -> Result<ParsedDocument> {
    match DocumentFormat::from_path(input_path) {
        DocumentFormat::Text => {
            let units = text::read_paragraphs(input_path)?;
            Ok(ParsedDocument { units, origin: DocumentOrigin::Text })
        }
        DocumentFormat::Epub => {
            let doc = epub::read(input_path)?;
            let units = doc.chapters.iter().flat_map(|c| c.units.clone()).collect();
            Ok(ParsedDocument { units, origin: DocumentOrigin::Epub(doc) })
        }
        DocumentFormat::Srt => {
            let cues = srt::parse(input_path)?;
            let units = srt::batch_cue_text(&cues);
            Ok(ParsedDocument { units, origin: DocumentOrigin::Srt(cues) })
        }
    }
}

/// Reassemble translated chunk texts (in ascending chunk-index order) into
/// the output artifact at `output_path`.
pub fn write(output_path: &Path, origin: &DocumentOrigin, translated_chunks: &[String]) -> Result<()> {
    match origin {
        DocumentOrigin::Text => text::write_paragraphs(output_path, translated_chunks),
        DocumentOrigin::Epub(doc) => {
            let total_units: usize = doc.chapters.iter().map(|c| c.units.len()).sum();
            let fragments = recover_units(translated_chunks, total_units);
            epub::write(output_path, doc, &fragments)
        }
        DocumentOrigin::Srt(cues) => {
            let fragments = recover_units(translated_chunks, cues.len());
            srt::write(output_path, cues, &fragments)
        }
    }
}

/// Recover one fragment per original translation unit from the final
/// ordered list of translated chunk texts, reversing the Chunker's
/// `"\n\n"`-join. If the translated fragment count drifts from `expected`
/// (the model merged or split a paragraph break), pads with empty strings
/// or folds the overflow into the final unit rather than failing the job.
fn recover_units(translated_chunks: &[String], expected: usize) -> Vec<String> {
    if expected == 0 {
        return Vec::new();
    }
    let joined = translated_chunks.join("\n\n");
    let mut fragments: Vec<String> = joined.split("\n\n").map(|s| s.to_string()).collect();

    match fragments.len().cmp(&expected) {
        std::cmp::Ordering::Equal => {}
        std::cmp::Ordering::Less => {
            tracing::warn!(
                got = fragments.len(),
                expected,
                "translation merged paragraph breaks; padding with empty units"
            );
            fragments.resize(expected, String::new());
        }
        std::cmp::Ordering::Greater => {
            tracing::warn!(
                got = fragments.len(),
                expected,
                "translation introduced extra paragraph breaks; folding overflow into final unit"
            );
            let overflow = fragments.split_off(expected - 1);
            fragments.push(overflow.join("\n\n"));
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("book.epub")), DocumentFormat::Epub);
        assert_eq!(DocumentFormat::from_path(Path::new("movie.srt")), DocumentFormat::Srt);
        assert_eq!(DocumentFormat::from_path(Path::new("novel.txt")), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("noext")), DocumentFormat::Text);
    }

    #[test]
    fn recover_units_matches_expected_count() {
        let chunks = vec!["«a»\n\n«b»".to_string(), "«c»".to_string()];
        let fragments = recover_units(&chunks, 3);
        assert_eq!(fragments, vec!["«a»", "«b»", "«c»"]);
    }

    #[test]
    fn recover_units_pads_when_translation_merges_paragraphs() {
        let chunks = vec!["«a b»".to_string()];
        let fragments = recover_units(&chunks, 2);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1], "");
    }

    #[test]
    fn recover_units_folds_overflow_when_translation_splits_paragraphs() {
        let chunks = vec!["«a»\n\n«b»\n\n«c»".to_string()];
        let fragments = recover_units(&chunks, 2);
        assert_eq!(fragments.len(), 2);
        assert!(fragments[1].contains("«b»") && fragments[1].contains("«c»"));
    }

    #[test]
    fn recover_units_empty_expected_is_empty() {
        assert!(recover_units(&[], 0).is_empty());
    }
}
