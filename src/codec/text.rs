//! Plain-text codec: paragraphs separated by one or more blank lines become
//! translation units; output rejoins translated units with a single blank
//! line, the same convention the Chunker uses to pack units into chunks.

use std::fs;
use std::path::Path;

use crate::error::Result;

pub fn read_paragraphs(input_path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(input_path)?;
    let units: Vec<String> = raw
        .split("\n\n")
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    Ok(units)
}

pub fn write_paragraphs(output_path: &Path, translated_chunks: &[String]) -> Result<()> {
    let body = translated_chunks.join("\n\n");
    fs::write(output_path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_tmp(contents: &str) -> NamedTempFile {
        let f = NamedTempFile::new().unwrap();
        fs::write(f.path(), contents).unwrap();
        f
    }

    #[test]
    fn splits_on_blank_lines_and_trims() {
        let f = write_tmp("First paragraph.\n\n  Second paragraph.  \n\n\nThird.");
        let units = read_paragraphs(f.path()).unwrap();
        assert_eq!(units, vec!["First paragraph.", "Second paragraph.", "Third."]);
    }

    #[test]
    fn empty_input_yields_no_units() {
        let f = write_tmp("");
        let units = read_paragraphs(f.path()).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn write_rejoins_with_blank_line() {
        let out = NamedTempFile::new().unwrap();
        write_paragraphs(out.path(), &["a".to_string(), "b".to_string()]).unwrap();
        let content = fs::read_to_string(out.path()).unwrap();
        assert_eq!(content, "a\n\nb");
    }
}
