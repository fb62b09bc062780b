//! Plain-text extraction for uploaded documents
//!
//! PDF goes through `pdf-extract`, DOCX is read from `word/document.xml`
//! inside the ZIP container, TXT and Markdown are decoded as UTF-8. All output
//! is NFC-normalized so identical documents chunk identically.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

/// Maximum decompressed bytes read from the DOCX body (zip-bomb guard)
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;

/// Declared format of an uploaded document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Txt,
    Markdown,
}

impl DocumentFormat {
    /// Detect the format from a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "text" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Detect the format of a path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        crate::utils::get_file_extension(path).and_then(|ext| Self::from_extension(&ext))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
            Self::Markdown => "markdown",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_extension(s)
            .ok_or_else(|| AgentError::Extraction(format!("unsupported document format: {}", s)))
    }
}

/// Extract plain text from raw document bytes
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String> {
    let raw = match format {
        DocumentFormat::Txt | DocumentFormat::Markdown => String::from_utf8(bytes.to_vec())
            .map_err(|e| AgentError::Extraction(format!("document is not valid UTF-8: {}", e)))?,
        DocumentFormat::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AgentError::Extraction(format!("PDF extraction failed: {}", e)))?,
        DocumentFormat::Docx => extract_docx(bytes)?,
    };
    Ok(raw.nfc().collect())
}

/// Read a file from disk, detect its format and extract its text
pub fn extract_file<P: AsRef<Path>>(path: P) -> Result<(DocumentFormat, String)> {
    let path = path.as_ref();
    let format = DocumentFormat::from_path(path).ok_or_else(|| {
        AgentError::Extraction(format!("unsupported file type: {}", path.display()))
    })?;
    let bytes = std::fs::read(path)?;
    let text = extract_text(&bytes, format)?;
    log::debug!(
        "Extracted {} chars from {} ({})",
        text.chars().count(),
        path.display(),
        format
    );
    Ok((format, text))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| AgentError::Extraction(format!("DOCX container: {}", e)))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| AgentError::Extraction(format!("DOCX body missing: {}", e)))?;

    let mut xml = Vec::new();
    entry.take(MAX_DOCX_XML_BYTES).read_to_end(&mut xml)?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(AgentError::Extraction(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_body_text(&xml)
}

/// Collect `w:t` runs, one line per `w:p` paragraph
fn docx_body_text(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| AgentError::Extraction(format!("DOCX text: {}", e)))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(AgentError::Extraction(format!("DOCX XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
