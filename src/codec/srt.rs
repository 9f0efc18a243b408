//! SubRip (.srt) codec. One translation unit per cue, so consecutive cues
//! batch naturally into a single chunk under the token budget; index and
//! timecode are preserved byte-for-byte on reassembly, only the cue text is
//! replaced.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, Result};

static TIMECODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{2}:\d{2}:\d{2},\d{3}) --> (\d{2}:\d{2}:\d{2},\d{3})(.*)$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub index: u32,
    pub start: String,
    pub end: String,
    /// Trailing text on the timecode line (e.g. positioning directives),
    /// carried through unchanged.
    pub timecode_suffix: String,
    pub text: String,
}

pub fn parse(input_path: &Path) -> Result<Vec<Cue>> {
    let raw = fs::read_to_string(input_path)?;
    parse_str(&raw)
}

pub fn parse_str(raw: &str) -> Result<Vec<Cue>> {
    let normalized = raw.replace("\r\n", "\n");
    let mut cues = Vec::new();

    for block in normalized.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut lines = block.lines();
        let index_line = lines.next().ok_or_else(|| {
            EngineError::InputInvalid("srt block missing index line".to_string())
        })?;
        let index: u32 = index_line.trim().parse().map_err(|_| {
            EngineError::InputInvalid(format!("invalid srt cue index: {index_line}"))
        })?;

        let timecode_line = lines.next().ok_or_else(|| {
            EngineError::InputInvalid(format!("srt cue {index} missing timecode line"))
        })?;
        let caps = TIMECODE.captures(timecode_line.trim()).ok_or_else(|| {
            EngineError::InputInvalid(format!("srt cue {index} has malformed timecode"))
        })?;

        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(Cue {
            index,
            start: caps[1].to_string(),
            end: caps[2].to_string(),
            timecode_suffix: caps[3].to_string(),
            text,
        });
    }

    Ok(cues)
}

/// One translation unit per cue, in source order.
pub fn batch_cue_text(cues: &[Cue]) -> Vec<String> {
    cues.iter().map(|c| c.text.clone()).collect()
}

pub fn write(output_path: &Path, cues: &[Cue], translated_text: &[String]) -> Result<()> {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        let text = translated_text.get(i).map(|s| s.as_str()).unwrap_or("");
        out.push_str(&cue.index.to_string());
        out.push('\n');
        out.push_str(&cue.start);
        out.push_str(" --> ");
        out.push_str(&cue.end);
        out.push_str(&cue.timecode_suffix);
        out.push('\n');
        out.push_str(text);
        out.push_str("\n\n");
    }
    fs::write(output_path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:04,000\nHello there.\n\n2\n00:00:05,500 --> 00:00:07,250\nLine one\nLine two\n\n";

    #[test]
    fn parses_cues_and_preserves_timecodes() {
        let cues = parse_str(SAMPLE).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].index, 1);
        assert_eq!(cues[0].start, "00:00:01,000");
        assert_eq!(cues[0].end, "00:00:04,000");
        assert_eq!(cues[0].text, "Hello there.");
        assert_eq!(cues[1].text, "Line one\nLine two");
    }

    #[test]
    fn rejects_malformed_timecode() {
        let bad = "1\nnot a timecode\nHello\n";
        assert!(parse_str(bad).is_err());
    }

    #[test]
    fn write_preserves_index_and_timecode_replaces_text() {
        let cues = parse_str(SAMPLE).unwrap();
        let translated: Vec<String> = vec!["Bonjour.".to_string(), "Un\nDeux".to_string()];
        let tmp = tempfile::NamedTempFile::new().unwrap();
        write(tmp.path(), &cues, &translated).unwrap();
        let out = fs::read_to_string(tmp.path()).unwrap();
        assert!(out.contains("1\n00:00:01,000 --> 00:00:04,000\nBonjour."));
        assert!(out.contains("2\n00:00:05,500 --> 00:00:07,250\nUn\nDeux"));
    }

    #[test]
    fn batch_yields_one_unit_per_cue() {
        let cues = parse_str(SAMPLE).unwrap();
        let units = batch_cue_text(&cues);
        assert_eq!(units, vec!["Hello there.".to_string(), "Line one\nLine two".to_string()]);
    }
}
