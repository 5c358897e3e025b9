//! Text extraction for spooled document files.
//!
//! [`parse_file`] turns a local file path into plain UTF-8 text. Format
//! detection is extension-based, which is why the ingestion task
//! preserves the original filename's extension when spooling. The
//! extractor is pure: no shared state, no database access; failures
//! surface as [`ExtractError`] and are handled by the pipeline.

use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Maximum decompressed bytes read from the DOCX XML entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Extract plain text from a local file, dispatching on its extension.
///
/// Unknown and missing extensions are read as text (lossy UTF-8), which
/// matches how plain `.txt`/`.md` uploads arrive.
pub fn parse_file(path: &Path) -> Result<String, ExtractError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => pdf_extract::extract_text(path).map_err(|e| ExtractError::Pdf(e.to_string())),
        "docx" => extract_docx(path),
        _ => {
            let bytes = std::fs::read(path)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let file = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ExtractError::Docx(e.to_string()))?;

    let mut xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut xml)?;
    }
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    collect_text_runs(&xml)
}

/// Collect `<w:t>` text runs; paragraph ends (`</w:p>`) become blank
/// lines so the chunker sees paragraph boundaries.
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text_run => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"t" => in_text_run = false,
                    b"p" => {
                        if !out.is_empty() && !out.ends_with("\n\n") {
                            out.push_str("\n\n");
                        }
                    }
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_text_is_read_verbatim() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "First line.\n\nSecond paragraph.").unwrap();
        let text = parse_file(&path).unwrap();
        assert_eq!(text, "First line.\n\nSecond paragraph.");
    }

    #[test]
    fn missing_extension_falls_back_to_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("README");
        std::fs::write(&path, "no extension here").unwrap();
        assert_eq!(parse_file(&path).unwrap(), "no extension here");
    }

    #[test]
    fn invalid_utf8_is_read_lossily() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.log");
        std::fs::write(&path, [b'o', b'k', 0xFF, b'!']).unwrap();
        let text = parse_file(&path).unwrap();
        assert!(text.starts_with("ok"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn invalid_pdf_returns_pdf_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, "not a pdf").unwrap();
        let err = parse_file(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_docx_returns_docx_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, "not a zip").unwrap();
        let err = parse_file(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn docx_text_runs_are_collected_with_paragraph_breaks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("doc.docx");

        let document_xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap();

        let text = parse_file(&path).unwrap();
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Second paragraph."));
        let first_end = text.find("First paragraph.").unwrap() + "First paragraph.".len();
        assert!(text[first_end..].starts_with('\n'));
    }
}
