//! EPUB codec. Reads the spine in order, captures each top-level `<body>`
//! child (`<p>`, `<h1>`, `<blockquote>`, ...) as one translation unit so the
//! placeholder protocol can later tokenize inline markup inside it; writes a
//! fresh, minimal EPUB 2.0 package rather than patching the original
//! archive, matching the fast-mode generation path.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read as _, Write as _};
use std::path::Path;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct EpubChapter {
    pub title: String,
    pub units: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EpubMetadata {
    pub title: String,
    pub author: Option<String>,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct EpubDocument {
    pub metadata: EpubMetadata,
    pub chapters: Vec<EpubChapter>,
}

pub fn read(input_path: &Path) -> Result<EpubDocument> {
    let file = File::open(input_path)?;
    let mut archive = ZipArchive::new(file).map_err(EngineError::Zip)?;

    let rootfile_path = parse_rootfile_path(&mut archive)?;
    let opf_xml = read_archive_entry(&mut archive, &rootfile_path)?;
    let metadata = parse_metadata(&opf_xml)?;
    let spine_hrefs = parse_manifest_and_spine(&opf_xml)?;

    let opf_dir = Path::new(&rootfile_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut chapters = Vec::with_capacity(spine_hrefs.len());
    for href in &spine_hrefs {
        let full_path = if opf_dir.is_empty() {
            href.clone()
        } else {
            format!("{opf_dir}/{href}")
        };
        let xhtml = read_archive_entry(&mut archive, &full_path)?;
        let units = parse_body_units(&xhtml)?;
        let title = chapter_title(&units).unwrap_or_else(|| format!("Chapter {}", chapters.len() + 1));
        chapters.push(EpubChapter { title, units });
    }

    Ok(EpubDocument { metadata, chapters })
}

fn read_archive_entry(archive: &mut ZipArchive<File>, path: &str) -> Result<String> {
    let mut entry = archive.by_name(path).map_err(EngineError::Zip)?;
    let mut contents = String::new();
    entry.read_to_string(&mut contents)?;
    Ok(contents)
}

fn parse_rootfile_path(archive: &mut ZipArchive<File>) -> Result<String> {
    let container = read_archive_entry(archive, "META-INF/container.xml")?;
    let mut reader = Reader::from_str(&container);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event().map_err(EngineError::Xml)? {
            Event::Empty(e) | Event::Start(e) if tag_local_name(e.name().as_ref()) == "rootfile" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"full-path" {
                        return Ok(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(EngineError::InputInvalid(
        "container.xml missing a rootfile full-path".to_string(),
    ))
}

fn parse_metadata(opf_xml: &str) -> Result<EpubMetadata> {
    let mut reader = Reader::from_str(opf_xml);
    reader.config_mut().trim_text(true);
    let mut metadata = EpubMetadata { language: "en".to_string(), ..Default::default() };
    let mut current: Option<String> = None;

    loop {
        match reader.read_event().map_err(EngineError::Xml)? {
            Event::Start(e) => current = Some(tag_local_name(e.name().as_ref())),
            Event::Text(t) => {
                let text = t.unescape().map_err(EngineError::Xml)?.into_owned();
                match current.as_deref() {
                    Some("title") if metadata.title.is_empty() => metadata.title = text,
                    Some("creator") => metadata.author = Some(text),
                    Some("language") => metadata.language = text,
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    if metadata.title.is_empty() {
        metadata.title = "Untitled".to_string();
    }
    Ok(metadata)
}

/// Manifest id -> href, then resolve the spine's ordered `idref`s through it.
fn parse_manifest_and_spine(opf_xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(opf_xml);
    reader.config_mut().trim_text(true);
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine_ids = Vec::new();

    loop {
        match reader.read_event().map_err(EngineError::Xml)? {
            Event::Empty(e) if tag_local_name(e.name().as_ref()) == "item" => {
                let mut id = None;
                let mut href = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"id" => id = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                        b"href" => href = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                        _ => {}
                    }
                }
                if let (Some(id), Some(href)) = (id, href) {
                    manifest.insert(id, href);
                }
            }
            Event::Empty(e) if tag_local_name(e.name().as_ref()) == "itemref" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"idref" {
                        spine_ids.push(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(spine_ids
        .into_iter()
        .filter_map(|id| manifest.get(&id).cloned())
        .collect())
}

/// Capture each top-level child of `<body>` as one serialized XHTML unit.
fn parse_body_units(xhtml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xhtml);
    reader.config_mut().trim_text(false);
    let mut units = Vec::new();
    let mut in_body = false;
    let mut body_depth = 0u32;

    loop {
        let event = reader.read_event().map_err(EngineError::Xml)?;
        match &event {
            Event::Eof => break,
            Event::Start(e) if tag_local_name(e.name().as_ref()) == "body" && !in_body => {
                in_body = true;
                body_depth = 0;
            }
            Event::End(e) if tag_local_name(e.name().as_ref()) == "body" && in_body => {
                break;
            }
            Event::Start(e) if in_body && body_depth == 0 => {
                let serialized = capture_subtree(&mut reader, e)?;
                units.push(serialized);
            }
            Event::Empty(e) if in_body && body_depth == 0 => {
                units.push(serialize_empty(e)?);
            }
            Event::Start(_) if in_body => body_depth += 1,
            Event::End(_) if in_body => body_depth = body_depth.saturating_sub(1),
            _ => {}
        }
    }

    Ok(units)
}

/// Consume a `Start` event through to its matching `End`, tracking depth for
/// any nested tag (unlike the placeholder protocol's same-name tracking,
/// since body children nest arbitrary tags like `<div><p>`).
fn capture_subtree(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<String> {
    let mut buf = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut buf));
    writer.write_event(Event::Start(start.to_owned())).map_err(EngineError::Xml)?;

    let mut depth = 1u32;
    loop {
        let event = reader.read_event().map_err(EngineError::Xml)?;
        match &event {
            Event::Eof => {
                return Err(EngineError::InputInvalid("unterminated body element".to_string()))
            }
            Event::Start(_) => {
                depth += 1;
                writer.write_event(event.clone()).map_err(EngineError::Xml)?;
            }
            Event::End(_) => {
                depth -= 1;
                writer.write_event(event.clone()).map_err(EngineError::Xml)?;
                if depth == 0 {
                    break;
                }
            }
            other => {
                writer.write_event(other.to_owned()).map_err(EngineError::Xml)?;
            }
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn serialize_empty(e: &BytesStart) -> Result<String> {
    let mut buf = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut buf));
    writer.write_event(Event::Empty(e.to_owned())).map_err(EngineError::Xml)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn tag_local_name(raw: &[u8]) -> String {
    let full = String::from_utf8_lossy(raw);
    full.rsplit(':').next().unwrap_or(&full).to_lowercase()
}

/// First heading-like unit's stripped text, used as a chapter title fallback.
fn chapter_title(units: &[String]) -> Option<String> {
    units.iter().find_map(|u| {
        if u.starts_with("<h1") || u.starts_with("<h2") || u.starts_with("<h3") {
            Some(strip_tags(u))
        } else {
            None
        }
    })
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for c in fragment.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

pub fn write(output_path: &Path, doc: &EpubDocument, translated_units: &[String]) -> Result<()> {
    let file = File::create(output_path)?;
    let mut zip = ZipWriter::new(file);

    let store_opts = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("mimetype", store_opts).map_err(EngineError::Zip)?;
    zip.write_all(b"application/epub+zip")?;

    let deflate_opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.add_directory("META-INF", deflate_opts).map_err(EngineError::Zip)?;
    zip.start_file("META-INF/container.xml", deflate_opts).map_err(EngineError::Zip)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    zip.add_directory("OEBPS", deflate_opts).map_err(EngineError::Zip)?;

    let mut offset = 0usize;
    let mut chapter_files = Vec::with_capacity(doc.chapters.len());
    for (i, chapter) in doc.chapters.iter().enumerate() {
        let take = chapter.units.len();
        let fragments = &translated_units[offset..(offset + take).min(translated_units.len())];
        offset += take;

        let filename = format!("chapter{:04}.xhtml", i + 1);
        let xhtml = render_chapter_xhtml(&chapter.title, fragments);
        zip.start_file(format!("OEBPS/{filename}"), deflate_opts).map_err(EngineError::Zip)?;
        zip.write_all(xhtml.as_bytes())?;
        chapter_files.push((filename, chapter.title.clone()));
    }

    zip.start_file("OEBPS/content.opf", deflate_opts).map_err(EngineError::Zip)?;
    zip.write_all(render_opf(&doc.metadata, &chapter_files).as_bytes())?;

    zip.start_file("OEBPS/toc.ncx", deflate_opts).map_err(EngineError::Zip)?;
    zip.write_all(render_ncx(&doc.metadata, &chapter_files).as_bytes())?;

    zip.finish().map_err(EngineError::Zip)?;
    Ok(())
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

fn render_chapter_xhtml(title: &str, fragments: &[String]) -> String {
    let body: String = fragments.join("\n");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body>
{body}
</body>
</html>
"#,
        title = xml_escape(title),
        body = body
    )
}

fn render_opf(metadata: &EpubMetadata, chapters: &[(String, String)]) -> String {
    let manifest_items: String = chapters
        .iter()
        .enumerate()
        .map(|(i, (filename, _))| {
            format!(
                r#"    <item id="chap{idx}" href="{filename}" media-type="application/xhtml+xml"/>"#,
                idx = i + 1,
                filename = filename
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let spine_items: String = chapters
        .iter()
        .enumerate()
        .map(|(i, _)| format!(r#"    <itemref idref="chap{}"/>"#, i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    let author_tag = metadata
        .author
        .as_deref()
        .map(|a| format!("    <dc:creator>{}</dc:creator>\n", xml_escape(a)))
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
{author}    <dc:language>{lang}</dc:language>
    <dc:identifier id="BookId">urn:uuid:longform-translate</dc:identifier>
  </metadata>
  <manifest>
{manifest}
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="ncx">
{spine}
  </spine>
</package>
"#,
        title = xml_escape(&metadata.title),
        author = author_tag,
        lang = xml_escape(&metadata.language),
        manifest = manifest_items,
        spine = spine_items,
    )
}

fn render_ncx(metadata: &EpubMetadata, chapters: &[(String, String)]) -> String {
    let nav_points: String = chapters
        .iter()
        .enumerate()
        .map(|(i, (filename, title))| {
            format!(
                r#"    <navPoint id="navPoint-{n}" playOrder="{n}">
      <navLabel><text>{title}</text></navLabel>
      <content src="{filename}"/>
    </navPoint>"#,
                n = i + 1,
                title = xml_escape(title),
                filename = filename
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="urn:uuid:longform-translate"/>
  </head>
  <docTitle><text>{title}</text></docTitle>
  <navMap>
{navpoints}
  </navMap>
</ncx>
"#,
        title = xml_escape(&metadata.title),
        navpoints = nav_points,
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_body_units_captures_top_level_children() {
        let xhtml = r#"<html><body><p>Hello <em>world</em></p><p>Second</p></body></html>"#;
        let units = parse_body_units(xhtml).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].contains("<p>Hello <em>world</em></p>"));
        assert!(units[1].contains("Second"));
    }

    #[test]
    fn parse_body_units_handles_nested_block_tags() {
        let xhtml = r#"<html><body><div><p>Nested</p></div></body></html>"#;
        let units = parse_body_units(xhtml).unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].contains("<div><p>Nested</p></div>"));
    }

    #[test]
    fn parse_body_units_on_empty_body_yields_no_units() {
        let xhtml = r#"<html><body></body></html>"#;
        let units = parse_body_units(xhtml).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn tag_local_name_strips_namespace_prefix() {
        assert_eq!(tag_local_name(b"dc:title"), "title");
        assert_eq!(tag_local_name(b"body"), "body");
    }

    #[test]
    fn xml_escape_covers_reserved_characters() {
        assert_eq!(xml_escape("<a & b>"), "&lt;a &amp; b&gt;");
    }
}
