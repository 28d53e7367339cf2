//! File intake validation
//!
//! `FileValidator::validate` runs a monotonic pipeline over one file and
//! returns a `FileValidation`. Every stage can only raise the risk; each
//! raise appends a human-readable reason. Malformed or hostile input never
//! produces an `Err`: unexpected I/O failures after the access check turn
//! the result `Unknown` instead.
//!
//! Stages:
//! 1. existence and read access (failure is Dangerous and final), location policy
//! 2. size (empty, absolute ceiling)
//! 3. magic-byte type detection vs. the extension's expected types
//! 4. per-type size ceiling
//! 5. streamed SHA-256
//! 6. bounded-window markup/script/XXE signature scan
//! 7. format-specific inspection (PDF actions, office macros, archive structure)

use crate::config::ValidatorConfig;
use crate::error::Result;
use crate::sniff::{self, MimeType};
use crate::types::{FileValidation, RiskLevel};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Chunk size for streamed hashing
const HASH_CHUNK: usize = 64 * 1024;

/// Most bytes read from `[Content_Types].xml`
const MANIFEST_LIMIT: u64 = 1024 * 1024;

/// Offending archive entries listed in one reason
const MAX_LISTED_ENTRIES: usize = 5;

/// Markup/script/XXE signatures, compiled once
fn content_signatures() -> &'static [(&'static str, Regex)] {
    static SIGNATURES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        let raw = vec![
            ("script tag", r"(?i-u)<script\b"),
            ("javascript: URI", r"(?i-u)javascript\s*:"),
            ("vbscript: URI", r"(?i-u)vbscript\s*:"),
            ("inline event handler", r"(?i-u)<[a-z][^>]*\son[a-z]+\s*="),
            ("iframe tag", r"(?i-u)<iframe\b"),
            ("object or embed tag", r"(?i-u)<(object|embed)\b"),
            ("XML entity declaration", r"(?i-u)<!ENTITY\b"),
            ("DOCTYPE internal subset", r"(?i-u)<!DOCTYPE[^>\[]*\["),
            (
                "external entity reference",
                r#"(?i-u)SYSTEM\s+["'](file|https?|ftp|php|expect|jar|netdoc):"#,
            ),
        ];

        raw.into_iter()
            .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|r| (name, r)))
            .collect()
    })
}

/// Interactive PDF name objects, compiled once
fn pdf_actions() -> &'static [(&'static str, Regex)] {
    static ACTIONS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    ACTIONS.get_or_init(|| {
        [
            "JavaScript",
            "JS",
            "OpenAction",
            "AA",
            "Launch",
            "URI",
            "SubmitForm",
            "EmbeddedFile",
        ]
        .into_iter()
        // a PDF name ends at the first non-regular character
        .filter_map(|name| {
            Regex::new(&format!(r"(?-u)/{}(?:[^A-Za-z0-9#]|$)", name))
                .ok()
                .map(|r| (name, r))
        })
        .collect()
    })
}

/// Which deep inspection applies to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inspection {
    Pdf,
    Office,
    Archive,
    None,
}

impl Inspection {
    /// Chosen by detected type; generic detections fall back to the extension
    fn select(detected: MimeType, extension: Option<&str>) -> Self {
        let office_extension = matches!(
            extension,
            Some(
                "docx" | "docm" | "dotx" | "dotm" | "xlsx" | "xlsm" | "xltx" | "xltm" | "pptx"
                    | "pptm" | "potx" | "potm"
            )
        );
        if detected.is_pdf() {
            return Inspection::Pdf;
        }
        // plain zip detection still gets macro checks under an office name
        if detected.is_office_archive() || (detected.is_zip_container() && office_extension) {
            return Inspection::Office;
        }
        if detected.is_zip_container() {
            return Inspection::Archive;
        }
        if !detected.is_generic() {
            return Inspection::None;
        }
        match extension {
            Some("pdf") => Inspection::Pdf,
            _ if office_extension => Inspection::Office,
            Some("zip") => Inspection::Archive,
            _ => Inspection::None,
        }
    }
}

/// Classifies files at intake.
///
/// Holds only immutable configuration; share one instance across any number
/// of worker threads.
#[derive(Debug, Clone)]
pub struct FileValidator {
    config: ValidatorConfig,
    allowed_roots: Vec<PathBuf>,
    restricted_roots: Vec<PathBuf>,
}

impl FileValidator {
    /// Create a validator, rejecting configuration that violates preconditions
    pub fn new(config: ValidatorConfig) -> Result<Self> {
        config.validate()?;
        let allowed_roots = config
            .allowed_directories
            .iter()
            .map(|p| canonical_or_raw(p))
            .collect();
        let restricted_roots = config
            .restricted_directories
            .iter()
            .map(|p| canonical_or_raw(p))
            .collect();
        Ok(Self {
            config,
            allowed_roots,
            restricted_roots,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Classify one file. Never fails; see the module docs for the stages.
    pub fn validate(&self, path: impl AsRef<Path>) -> FileValidation {
        let path = path.as_ref();
        let mut validation = FileValidation::new(path);
        tracing::debug!(path = %path.display(), "Validating file");

        let (mut file, metadata) = match open_for_read(path) {
            Ok(opened) => opened,
            Err(reason) => {
                validation.flag(RiskLevel::Dangerous, reason);
                log_outcome(&validation);
                return validation;
            }
        };

        self.check_location(path, &mut validation);
        self.classify(path, &mut file, metadata.len(), &mut validation);

        log_outcome(&validation);
        validation
    }

    /// Stages 2–7 over an already opened reader
    fn classify<R: Read + Seek>(
        &self,
        path: &Path,
        reader: &mut R,
        size: u64,
        validation: &mut FileValidation,
    ) {
        validation.set_size(size);
        if size == 0 {
            validation.flag(RiskLevel::Suspicious, "File is empty (0 bytes)");
        }
        let oversized = size > self.config.max_file_size;
        if oversized {
            validation.flag(
                RiskLevel::Dangerous,
                format!(
                    "File size {} bytes exceeds maximum of {} bytes",
                    size, self.config.max_file_size
                ),
            );
        }

        if let Err(e) = self.inspect(path, reader, size, oversized, validation) {
            validation.flag(
                RiskLevel::Unknown,
                format!("Validation could not complete: I/O error: {}", e),
            );
        }
    }

    /// Stages 3–7. Any `Err` here becomes an `Unknown` classification.
    fn inspect<R: Read + Seek>(
        &self,
        path: &Path,
        file: &mut R,
        size: u64,
        oversized: bool,
        validation: &mut FileValidation,
    ) -> io::Result<()> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        // Stage 3: type detection
        let header = read_prefix(file, sniff::SNIFF_LEN)?;
        let detected = sniff::detect(&header);
        validation.set_detected_type(detected.as_str());
        match extension.as_deref() {
            Some(ext) => match sniff::expected_types(ext) {
                Some(expected) if !expected.contains(&detected.as_str()) => {
                    validation.flag(
                        RiskLevel::Suspicious,
                        format!(
                            "Content type {} does not match .{} extension (expected {})",
                            detected,
                            ext,
                            expected.join(" or ")
                        ),
                    );
                }
                Some(_) => {}
                None => validation.insert_metadata("unknown_extension", true),
            },
            None => validation.insert_metadata("unknown_extension", true),
        }

        // Stage 4: per-type ceiling
        if let Some(&limit) = self.config.type_size_limits.get(detected.as_str()) {
            if size > limit {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!(
                        "File size {} bytes exceeds the {} limit of {} bytes",
                        size, detected, limit
                    ),
                );
            }
        }

        if oversized {
            tracing::debug!(path = %path.display(), "Skipping content stages for oversized file");
            return Ok(());
        }

        // Stage 5: streamed hash
        validation.set_content_hash(hash_file(file)?);

        // Stage 6: signature scan
        let window = read_prefix(file, self.config.content_scan_bytes)?;
        for (name, pattern) in content_signatures() {
            if pattern.is_match(&window) {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!("Potentially malicious content: {}", name),
                );
            }
        }

        // Stage 7: format-specific inspection
        match Inspection::select(detected, extension.as_deref()) {
            Inspection::Pdf => self.inspect_pdf(file, validation)?,
            Inspection::Office => self.inspect_archive(file, size, true, validation)?,
            Inspection::Archive => self.inspect_archive(file, size, false, validation)?,
            Inspection::None => {}
        }

        Ok(())
    }

    fn check_location(&self, path: &Path, validation: &mut FileValidation) {
        if self.allowed_roots.is_empty() && self.restricted_roots.is_empty() {
            return;
        }
        let resolved = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                validation.flag(
                    RiskLevel::Dangerous,
                    format!("Cannot resolve file location: {}", e),
                );
                return;
            }
        };

        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|root| resolved.starts_with(root))
        {
            validation.flag(
                RiskLevel::Dangerous,
                format!("File {} is outside the allowed directories", resolved.display()),
            );
        }
        if let Some(root) = self.restricted_roots.iter().find(|root| resolved.starts_with(root)) {
            validation.flag(
                RiskLevel::Dangerous,
                format!("File is inside restricted directory {}", root.display()),
            );
        }
    }

    fn inspect_pdf<R: Read + Seek>(
        &self,
        file: &mut R,
        validation: &mut FileValidation,
    ) -> io::Result<()> {
        let window = read_prefix(file, self.config.pdf_scan_bytes)?;
        if !window.starts_with(b"%PDF-") {
            validation.flag(RiskLevel::Suspicious, "PDF is missing the %PDF- header");
        }

        let mut found = Vec::new();
        for (name, pattern) in pdf_actions() {
            if pattern.is_match(&window) {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!("PDF contains interactive action /{}", name),
                );
                found.push(*name);
            }
        }
        if !found.is_empty() {
            validation.insert_metadata("pdf_actions", found);
        }
        Ok(())
    }

    /// Zip structure checks, plus macro checks when `office` is set.
    fn inspect_archive<R: Read + Seek>(
        &self,
        file: &mut R,
        size: u64,
        office: bool,
        validation: &mut FileValidation,
    ) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut archive = match zip::ZipArchive::new(&mut *file) {
            Ok(archive) => archive,
            Err(e) => {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!("Archive is corrupt or unreadable: {}", e),
                );
                return Ok(());
            }
        };

        let entry_count = archive.len();
        validation.insert_metadata("entry_count", entry_count as u64);
        if entry_count > self.config.max_archive_entries {
            validation.flag(
                RiskLevel::Suspicious,
                format!(
                    "Archive has {} entries, more than the limit of {}",
                    entry_count, self.config.max_archive_entries
                ),
            );
        }

        let mut uncompressed: u64 = 0;
        let mut max_depth = 0usize;
        let mut escaping = Vec::new();
        let mut macro_entries = Vec::new();

        for index in 0..entry_count {
            let entry = match archive.by_index_raw(index) {
                Ok(entry) => entry,
                Err(e) => {
                    validation.flag(
                        RiskLevel::Suspicious,
                        format!("Archive is corrupt at entry {}: {}", index, e),
                    );
                    break;
                }
            };
            let name = entry.name();
            uncompressed = uncompressed.saturating_add(entry.size());
            max_depth = max_depth.max(path_depth(name));
            if escapes_root(name) {
                escaping.push(name.to_string());
            }
            if office && is_macro_entry(name) {
                macro_entries.push(name.to_string());
            }
        }

        validation.insert_metadata("uncompressed_size", uncompressed);
        if size > 0 {
            let ratio = uncompressed as f64 / size as f64;
            validation.insert_metadata("compression_ratio", ratio);
            if ratio > self.config.max_compression_ratio {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!(
                        "Compression ratio {:.1}:1 exceeds limit of {}:1 (possible zip bomb)",
                        ratio, self.config.max_compression_ratio
                    ),
                );
            }
        }

        if !escaping.is_empty() {
            validation.insert_metadata("traversal_entries", escaping.clone());
            validation.flag(
                RiskLevel::Dangerous,
                format!(
                    "Archive entries escape the extraction root (path traversal): {}",
                    list_entries(&escaping)
                ),
            );
        }

        validation.insert_metadata("max_path_depth", max_depth as u64);
        if max_depth > self.config.max_archive_depth {
            validation.flag(
                RiskLevel::Suspicious,
                format!(
                    "Archive nesting depth {} exceeds limit of {}",
                    max_depth, self.config.max_archive_depth
                ),
            );
        }

        if !office {
            return Ok(());
        }

        if !macro_entries.is_empty() {
            validation.flag(
                RiskLevel::Suspicious,
                format!("Office document contains macro parts: {}", list_entries(&macro_entries)),
            );
        }

        let manifest = match archive.by_name("[Content_Types].xml") {
            Ok(entry) => {
                let mut buf = Vec::new();
                match entry.take(MANIFEST_LIMIT).read_to_end(&mut buf) {
                    Ok(_) => Some(buf),
                    Err(e) => {
                        validation.flag(
                            RiskLevel::Suspicious,
                            format!("Office content-type manifest is corrupt: {}", e),
                        );
                        None
                    }
                }
            }
            Err(zip::result::ZipError::FileNotFound) => {
                validation.flag(
                    RiskLevel::Suspicious,
                    "Office document has no content-type manifest",
                );
                None
            }
            Err(e) => {
                validation.flag(
                    RiskLevel::Suspicious,
                    format!("Office content-type manifest is unreadable: {}", e),
                );
                None
            }
        };

        if let Some(manifest) = manifest {
            let manifest = String::from_utf8_lossy(&manifest).to_ascii_lowercase();
            if manifest.contains("macroenabled") || manifest.contains("vbaproject") {
                validation.flag(
                    RiskLevel::Suspicious,
                    "Office content types declare macro-enabled content",
                );
            }
        }

        Ok(())
    }
}

/// Open a file for reading, describing any failure as a reason string
fn open_for_read(path: &Path) -> std::result::Result<(File, Metadata), String> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => format!("File does not exist: {}", path.display()),
        _ => format!("File is not accessible: {}", e),
    })?;
    if !metadata.is_file() {
        return Err(format!("Not a regular file: {}", path.display()));
    }
    let file = File::open(path).map_err(|e| format!("File is not readable: {}", e))?;
    Ok((file, metadata))
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Read up to `limit` bytes from the start of the file
fn read_prefix<R: Read + Seek>(file: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::with_capacity(limit.min(HASH_CHUNK));
    file.by_ref().take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// SHA-256 in fixed-size chunks; memory use is independent of file size
fn hash_file<R: Read + Seek>(file: &mut R) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK];
    loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// An entry name that could land outside the extraction directory.
///
/// Any `..` sequence counts, not just a whole `..` component: extractors
/// disagree on how they split and normalize names.
fn escapes_root(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return true;
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    name.contains("..")
}

/// Number of path separators, ignoring a trailing directory slash
fn path_depth(name: &str) -> usize {
    name.trim_end_matches(['/', '\\'])
        .chars()
        .filter(|c| *c == '/' || *c == '\\')
        .count()
}

fn is_macro_entry(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with("vbaproject.bin")
        || lower.ends_with("vbadata.xml")
        || lower.starts_with("macros/")
        || lower.contains("/macros/")
        || lower.contains("activex/")
}

fn list_entries(names: &[String]) -> String {
    let mut listed = names
        .iter()
        .take(MAX_LISTED_ENTRIES)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > MAX_LISTED_ENTRIES {
        listed.push_str(&format!(" (+{} more)", names.len() - MAX_LISTED_ENTRIES));
    }
    listed
}

fn log_outcome(validation: &FileValidation) {
    if validation.risk() == RiskLevel::Safe {
        tracing::debug!(
            path = %validation.path().display(),
            detected_type = %validation.detected_type(),
            "File passed validation"
        );
    } else {
        tracing::warn!(
            path = %validation.path().display(),
            risk = %validation.risk(),
            reasons = ?validation.reasons(),
            "File flagged during validation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn validator() -> FileValidator {
        FileValidator::new(ValidatorConfig::default()).unwrap()
    }

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn write_zip(dir: &TempDir, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.path().join(name);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (entry, data) in entries {
            writer.start_file(*entry, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_clean_text_is_safe() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "notes.txt", b"Quarterly numbers look fine.\n");
        let result = validator().validate(&path);

        assert_eq!(result.risk(), RiskLevel::Safe);
        assert!(result.reasons().is_empty());
        assert_eq!(result.detected_type(), "text/plain");
        assert_eq!(result.size(), 29);
        assert_eq!(result.content_hash().len(), 64);
    }

    #[test]
    fn test_missing_file_is_dangerous_and_final() {
        let dir = TempDir::new().unwrap();
        let result = validator().validate(dir.path().join("nope.pdf"));
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("does not exist"));
        assert!(result.detected_type().is_empty());
        assert!(result.content_hash().is_empty());
    }

    #[test]
    fn test_directory_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let result = validator().validate(dir.path());
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("not a regular file"));
    }

    #[test]
    fn test_empty_file_is_suspicious() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.txt", b"");
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("empty"));
    }

    #[test]
    fn test_oversized_file_is_dangerous_and_not_hashed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "big.txt", &vec![b'a'; 2048]);
        let config = ValidatorConfig {
            max_file_size: 1024,
            ..Default::default()
        };
        let result = FileValidator::new(config).unwrap().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("exceeds maximum"));
        assert!(result.content_hash().is_empty());
        assert_eq!(result.detected_type(), "text/plain");
    }

    #[test]
    fn test_extension_mismatch_is_suspicious() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "report.pdf", b"just some plain text pretending");
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("does not match .pdf"));
        // generic detection falls back to the extension for deep inspection
        assert!(result.has_reason("missing the %PDF- header"));
    }

    #[test]
    fn test_per_type_ceiling() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", &vec![b'x'; 600]);
        let mut config = ValidatorConfig::default();
        config.type_size_limits.insert("text/plain".into(), 512);
        let result = FileValidator::new(config).unwrap().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("text/plain limit"));
    }

    #[test]
    fn test_script_signatures_raise_per_match() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "page.txt",
            b"hello <SCRIPT>alert(1)</SCRIPT> <a href=\"javascript:void(0)\">x</a>",
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("script tag"));
        assert!(result.has_reason("javascript: URI"));
    }

    #[test]
    fn test_xxe_signature() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "data.xml",
            br#"<?xml version="1.0"?><!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><foo>&xxe;</foo>"#,
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("XML entity declaration"));
        assert!(result.has_reason("external entity reference"));
    }

    #[test]
    fn test_pdf_actions() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "form.pdf",
            b"%PDF-1.4\n1 0 obj << /Type /Catalog /OpenAction 2 0 R >> endobj\n2 0 obj << /S /JavaScript /JS (app.alert(1)) >> endobj\n%%EOF",
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("/OpenAction"));
        assert!(result.has_reason("/JavaScript"));
        assert!(result.has_reason("/JS"));
        assert!(!result.has_reason("/Launch"));
    }

    #[test]
    fn test_plain_pdf_is_safe() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "plain.pdf",
            b"%PDF-1.4\n1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n%%EOF",
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Safe, "{:?}", result.reasons());
    }

    #[test]
    fn test_zip_bomb_ratio() {
        let dir = TempDir::new().unwrap();
        let zeros = vec![0u8; 4 * 1024 * 1024];
        let path = write_zip(&dir, "bomb.zip", &[("zeros.bin", &zeros)]);
        let result = validator().validate(&path);

        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("compression ratio"));
        assert!(result.metadata()["compression_ratio"].as_f64().unwrap() > 100.0);
    }

    #[test]
    fn test_zip_traversal_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(
            &dir,
            "evil.zip",
            &[("ok.txt", b"fine"), ("../../etc/cron.d/job", b"* * * * * root sh")],
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("path traversal"));
    }

    #[test]
    fn test_zip_dotdot_inside_name_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(
            &dir,
            "notes.zip",
            &[("docs/readme.txt", b"hello"), ("docs/notes..txt", b"hello")],
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("docs/notes..txt"));
        assert_eq!(
            result.metadata()["traversal_entries"],
            serde_json::json!(["docs/notes..txt"])
        );
    }

    #[test]
    fn test_zip_absolute_entry_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(&dir, "abs.zip", &[("/etc/passwd", b"root:x:0:0")]);
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Dangerous);
    }

    #[test]
    fn test_zip_depth() {
        let dir = TempDir::new().unwrap();
        let deep = (0..25).map(|i| format!("d{}", i)).collect::<Vec<_>>().join("/") + "/f.txt";
        let path = write_zip(&dir, "deep.zip", &[(deep.as_str(), b"x")]);
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("nesting depth"));
    }

    #[test]
    fn test_corrupt_zip_is_suspicious() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "broken.zip", b"PK\x03\x04this is not really a zip");
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious);
        assert!(result.has_reason("corrupt"));
    }

    #[test]
    fn test_macro_enabled_office_document() {
        let dir = TempDir::new().unwrap();
        let content_types = br#"<?xml version="1.0"?><Types><Override PartName="/word/document.xml" ContentType="application/vnd.ms-word.document.macroEnabled.main+xml"/></Types>"#;
        let path = write_zip(
            &dir,
            "invoice.docm",
            &[
                ("[Content_Types].xml", content_types),
                ("_rels/.rels", b"<Relationships/>"),
                ("word/document.xml", b"<w:document/>"),
                ("word/vbaProject.bin", b"\xd0\xcf\x11\xe0"),
            ],
        );
        let result = validator().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Suspicious, "{:?}", result.reasons());
        assert!(result.has_reason("macro parts"));
        assert!(result.has_reason("macro-enabled content"));
    }

    #[test]
    fn test_restricted_directory() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", b"hello");
        let config = ValidatorConfig {
            restricted_directories: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let result = FileValidator::new(config).unwrap().validate(&path);
        assert_eq!(result.risk(), RiskLevel::Dangerous);
        assert!(result.has_reason("restricted directory"));
    }

    #[test]
    fn test_outside_allowed_directories() {
        let allowed = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let path = write_file(&elsewhere, "a.txt", b"hello");
        let config = ValidatorConfig {
            allowed_directories: vec![allowed.path().to_path_buf()],
            ..Default::default()
        };
        let validator = FileValidator::new(config).unwrap();
        assert_eq!(validator.validate(&path).risk(), RiskLevel::Dangerous);

        let inside = write_file(&allowed, "b.txt", b"hello");
        assert_eq!(validator.validate(&inside).risk(), RiskLevel::Safe);
    }

    /// Serves `budget` bytes in total, then every read fails
    struct FlakyReader {
        inner: io::Cursor<Vec<u8>>,
        budget: usize,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("device went away"));
            }
            let limit = buf.len().min(self.budget);
            let n = self.inner.read(&mut buf[..limit])?;
            self.budget -= n;
            Ok(n)
        }
    }

    impl Seek for FlakyReader {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_read_failure_mid_pipeline_is_unknown() {
        // plain text under a .pdf name: the type stage flags it, then hashing fails
        let content = b"not a pdf at all\n".repeat(4096);
        let size = content.len() as u64;
        let mut reader = FlakyReader {
            inner: io::Cursor::new(content),
            budget: 20_000,
        };
        let path = Path::new("/uploads/report.pdf");
        let mut validation = FileValidation::new(path);

        validator().classify(path, &mut reader, size, &mut validation);

        assert_eq!(validation.risk(), RiskLevel::Unknown);
        assert!(!validation.risk().is_cleared());
        assert!(validation.has_reason("does not match .pdf"));
        assert!(validation.has_reason("I/O error: device went away"));
        assert_eq!(validation.metadata()["partial_risk"], "suspicious");
        assert!(validation.content_hash().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ValidatorConfig {
            max_file_size: 0,
            ..Default::default()
        };
        assert!(FileValidator::new(config).is_err());
    }

    #[test]
    fn test_entry_name_helpers() {
        assert!(escapes_root("../x"));
        assert!(escapes_root("a/../../x"));
        assert!(escapes_root("a\\..\\x"));
        assert!(escapes_root("/abs"));
        assert!(escapes_root("C:\\Windows\\x"));
        assert!(escapes_root("a/b..c/d"));
        assert!(escapes_root("docs/notes..txt"));
        assert!(!escapes_root("dir/file.txt"));
        assert!(!escapes_root("dir/.hidden/a.b.c"));

        assert_eq!(path_depth("a.txt"), 0);
        assert_eq!(path_depth("a/b/c.txt"), 2);
        assert_eq!(path_depth("a/b/"), 1);
    }
}
