//! Shared PDF helpers used across multiple modules.

use std::path::Path;

use time::OffsetDateTime;

use crate::object::Dictionary;

/// Format `t` as a PDF date string (`D:YYYYMMDDHHmmSSOHH'mm'`).
///
/// ```
/// use time::macros::datetime;
/// assert_eq!(attachpdf::pdf_date(datetime!(2024-03-05 14:07:09 UTC)), "D:20240305140709Z");
/// ```
pub fn pdf_date(t: OffsetDateTime) -> String {
    let mut out = format!(
        "D:{:04}{:02}{:02}{:02}{:02}{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    let offset = t.offset();
    if offset.is_utc() {
        out.push('Z');
    } else {
        let (h, m, _) = offset.as_hms();
        let sign = if offset.is_negative() { '-' } else { '+' };
        out.push_str(&format!("{sign}{:02}'{:02}'", h.unsigned_abs(), m.unsigned_abs()));
    }
    out
}

/// Encode `s` as a PDF text string: plain bytes when ASCII, otherwise
/// UTF-16BE with a byte order mark.
pub fn encode_text_string(s: &str) -> Vec<u8> {
    if s.is_ascii() {
        return s.as_bytes().to_vec();
    }
    let mut out = vec![0xfe, 0xff];
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Decode a PDF text string (UTF-16BE or UTF-8 with BOM, else
/// PDFDocEncoding read as Latin-1).
pub fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xfe, 0xff]) {
        let units = rest.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
        return char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xef, 0xbb, 0xbf]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Read a non-empty text string from `dict[key]`.
pub(crate) fn string_from_dict(dict: &Dictionary, key: &[u8]) -> Option<String> {
    dict.get(key)
        .and_then(|v| v.as_str())
        .map(decode_text_string)
        .filter(|s| !s.is_empty())
}

/// Guess a MIME type from the file extension.
pub(crate) fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "xml" => "application/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => return None,
    };
    Some(mime)
}

/// Encode raw bytes as a lowercase hex string.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
