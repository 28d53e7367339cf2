//! Content type detection from magic bytes
//!
//! The detected type depends only on the header bytes, never on the
//! filename. Detection is total: anything unrecognised falls back to
//! `text/plain` or `application/octet-stream`.

use std::fmt;

/// Header bytes the validator reads for detection
pub const SNIFF_LEN: usize = 8192;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain";
pub const ZIP: &str = "application/zip";
pub const PDF: &str = "application/pdf";

const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
const OLE: &str = "application/x-ole-storage";

/// A detected MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MimeType(&'static str);

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    pub fn is_pdf(&self) -> bool {
        self.0 == PDF
    }

    /// OOXML documents (zip-based, may carry VBA macros)
    pub fn is_office_archive(&self) -> bool {
        self.0.starts_with("application/vnd.openxmlformats-officedocument.")
    }

    /// Any format whose container is a zip archive
    pub fn is_zip_container(&self) -> bool {
        self.is_office_archive()
            || matches!(
                self.0,
                ZIP | "application/epub+zip"
                    | "application/java-archive"
                    | "application/vnd.oasis.opendocument.text"
                    | "application/vnd.oasis.opendocument.spreadsheet"
                    | "application/vnd.oasis.opendocument.presentation"
            )
    }

    /// Fallback types that carry no format information
    pub fn is_generic(&self) -> bool {
        matches!(self.0, TEXT_PLAIN | OCTET_STREAM)
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Detect the content type of `header`.
///
/// Only the bytes given are inspected; pass at most [`SNIFF_LEN`] bytes.
pub fn detect(header: &[u8]) -> MimeType {
    if let Some(kind) = infer::get(header) {
        return MimeType(kind.mime_type());
    }
    if looks_like_text(header) {
        MimeType(TEXT_PLAIN)
    } else {
        MimeType(OCTET_STREAM)
    }
}

/// UTF-8 without NUL bytes. A multi-byte sequence cut off by the end of the
/// header still counts as text.
fn looks_like_text(header: &[u8]) -> bool {
    if header.contains(&0) {
        return false;
    }
    match std::str::from_utf8(header) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Expected MIME types for a lower-case file extension.
///
/// `None` means the extension is outside the table and carries no
/// expectation.
pub fn expected_types(extension: &str) -> Option<&'static [&'static str]> {
    let types: &'static [&'static str] = match extension {
        "pdf" => &[PDF],
        "zip" => &[ZIP],
        "docx" | "docm" | "dotx" | "dotm" => &[DOCX, ZIP],
        "xlsx" | "xlsm" | "xltx" | "xltm" => &[XLSX, ZIP],
        "pptx" | "pptm" | "potx" | "potm" => &[PPTX, ZIP],
        "doc" => &["application/msword", OLE],
        "xls" => &["application/vnd.ms-excel", OLE],
        "ppt" => &["application/vnd.ms-powerpoint", OLE],
        "epub" => &["application/epub+zip", ZIP],
        "odt" => &["application/vnd.oasis.opendocument.text", ZIP],
        "ods" => &["application/vnd.oasis.opendocument.spreadsheet", ZIP],
        "odp" => &["application/vnd.oasis.opendocument.presentation", ZIP],
        "rtf" => &["application/rtf", "text/rtf", TEXT_PLAIN],
        "txt" | "md" | "markdown" | "csv" | "tsv" | "log" => &[TEXT_PLAIN],
        "json" => &["application/json", TEXT_PLAIN],
        "html" | "htm" => &["text/html", TEXT_PLAIN],
        "xml" => &["text/xml", "application/xml", TEXT_PLAIN],
        "png" => &["image/png"],
        "jpg" | "jpeg" => &["image/jpeg"],
        "gif" => &["image/gif"],
        "webp" => &["image/webp"],
        "bmp" => &["image/bmp"],
        "tif" | "tiff" => &["image/tiff"],
        _ => return None,
    };
    Some(types)
}
