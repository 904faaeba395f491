//! Upload validation: declared size and type, magic-byte sniffing, and
//! filename sanitizing.
//!
//! Declared metadata is never trusted on its own.  The leading bytes of the
//! content decide the real type, and the declared type must agree with it.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;

use crate::config::UploadConfig;

/// How many leading bytes are inspected when sniffing.
pub const SNIFF_LEN: u64 = 512;

/// Fallback type when nothing more specific is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Declared or actual size is above the ceiling.
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    /// The content type is not allowed, or does not match the content.
    #[error("content type {content_type} rejected")]
    InvalidType { content_type: String },

    /// The upload has no bytes to inspect.
    #[error("file is empty")]
    Empty,

    /// The content stream could not be read or rewound.
    #[error("cannot read file: {0}")]
    Unreadable(#[from] std::io::Error),
}

/// Checks declarations and content against the upload policy.
#[derive(Debug, Clone)]
pub struct Validator {
    max_file_size: u64,
    allowed_types: HashSet<String>,
}

impl Validator {
    /// Create a validator with a size ceiling and a type allow-list.
    pub fn new(max_file_size: u64, allowed_types: &[String]) -> Self {
        Self {
            max_file_size,
            allowed_types: allowed_types.iter().map(|t| essence(t)).collect(),
        }
    }

    /// Build a validator from the `upload` configuration section.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_file_size, &config.allowed_types)
    }

    /// The configured size ceiling in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Check the declaration made alongside an upload.
    ///
    /// An empty `declared_content_type` is replaced by the type inferred from
    /// the file extension.  Returns the effective, normalized content type.
    pub fn validate_declaration(
        &self,
        file_name: &str,
        declared_size: u64,
        declared_content_type: &str,
    ) -> Result<String, ValidationError> {
        if declared_size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                size: declared_size,
                max: self.max_file_size,
            });
        }

        let content_type = if declared_content_type.trim().is_empty() {
            content_type_from_extension(file_name).to_string()
        } else {
            essence(declared_content_type)
        };

        if !self.allowed_types.contains(&content_type) {
            return Err(ValidationError::InvalidType { content_type });
        }
        Ok(content_type)
    }

    /// Sniff the leading bytes of `reader` and check them against
    /// `declared_content_type`.
    ///
    /// The stream is rewound to where it started before returning, on
    /// success and on type mismatch alike.
    pub fn validate_content<R: Read + Seek>(
        &self,
        reader: &mut R,
        declared_content_type: &str,
    ) -> Result<(), ValidationError> {
        let start = reader.stream_position()?;
        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        reader.by_ref().take(SNIFF_LEN).read_to_end(&mut head)?;
        reader.seek(SeekFrom::Start(start))?;

        if head.is_empty() {
            return Err(ValidationError::Empty);
        }

        let detected = sniff_content_type(&head);
        if !is_compatible(&essence(declared_content_type), detected) {
            tracing::debug!(
                "Declared type {} does not match sniffed type {}",
                declared_content_type,
                detected
            );
            return Err(ValidationError::InvalidType {
                content_type: declared_content_type.to_string(),
            });
        }
        Ok(())
    }
}

/// Lowercased media type without parameters (`"Image/PNG; q=1"` -> `"image/png"`).
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Aliases that name the same format.
const COMPATIBLE_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "image/jpg"),
    ("application/gzip", "application/x-gzip"),
];

/// `true` if `declared` equals `detected` or is a known alias of it.
fn is_compatible(declared: &str, detected: &str) -> bool {
    let detected = essence(detected);
    declared == detected
        || COMPATIBLE_TYPES
            .iter()
            .any(|(a, b)| (declared == *a && detected == *b) || (declared == *b && detected == *a))
}

/// Map a filename extension to a content type.
pub fn content_type_from_extension(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => OCTET_STREAM,
    }
}

/// Magic-number signatures checked in order.  The first match wins.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"OggS\x00", "application/ogg"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xef\xbb\xbf", "text/plain; charset=utf-8"),
];

/// Infer a content type from the leading bytes of a file.
///
/// Falls back to `text/plain` when the sample holds no binary control bytes
/// and to [`OCTET_STREAM`] otherwise.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN as usize)];

    if let Some((_, content_type)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *content_type;
    }

    // RIFF containers carry their format tag at offset 8.
    if data.len() >= 14 && data.starts_with(b"RIFF") && &data[8..14] == b"WEBPVP" {
        return "image/webp";
    }

    let trimmed = trim_leading_whitespace(data);
    if starts_with_ignore_case(trimmed, b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if starts_with_ignore_case(trimmed, b"<!doctype html") || starts_with_ignore_case(trimmed, b"<html") {
        return "text/html; charset=utf-8";
    }

    if data.iter().any(|b| is_binary_byte(*b)) {
        OCTET_STREAM
    } else {
        "text/plain; charset=utf-8"
    }
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f)
}

/// Reduce a client-supplied filename to a display-only name.
///
/// Keeps the final path segment, then strips every `..`, `/` and `\` so the
/// result can never act as a path.  The result is never used for addressing.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = base.replace("..", "").replace(['/', '\\'], "");
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
