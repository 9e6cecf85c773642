use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::lexer::Cursor;
use crate::object::{Dictionary, Object, MAX_OBJECT_NUMBER};
use crate::parser::{malformed, parse_indirect_object_at, scan_object_headers, Parser};
use crate::{AttachError, Result};

/// Only this many trailing bytes are searched for `startxref`.
const STARTXREF_WINDOW: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XrefEntry {
    InUse { offset: usize, generation: u16 },
    Free { next: u32, generation: u16 },
}

#[derive(Debug)]
pub(crate) struct XrefTable {
    pub(crate) entries: BTreeMap<u32, XrefEntry>,
    /// The newest trailer in the chain.
    pub(crate) trailer: Dictionary,
    /// Offset of the newest section; `/Prev` of an incremental update.
    pub(crate) startxref: usize,
}

impl XrefTable {
    pub(crate) fn in_use(&self) -> impl Iterator<Item = (u32, usize, u16)> + '_ {
        self.entries.iter().filter_map(|(num, entry)| match entry {
            XrefEntry::InUse { offset, generation } => Some((*num, *offset, *generation)),
            XrefEntry::Free { .. } => None,
        })
    }
}

pub(crate) fn find_startxref(bytes: &[u8]) -> Result<usize> {
    let window_start = bytes.len().saturating_sub(STARTXREF_WINDOW);
    let rel = memchr::memmem::rfind(&bytes[window_start..], b"startxref")
        .ok_or_else(|| AttachError::MalformedDocument("startxref not found".into()))?;
    let pos = window_start + rel + b"startxref".len();
    let mut cur = Cursor::new(bytes, pos);
    cur.skip_ws_and_comments();
    cur.read_unsigned()
        .and_then(|off| usize::try_from(off).ok())
        .ok_or_else(|| malformed(pos, "startxref without offset"))
}

/// Read the section at `startxref` and every older one reachable via `/Prev`.
pub(crate) fn read_xref_chain(bytes: &[u8], startxref: usize) -> Result<XrefTable> {
    let mut entries = BTreeMap::new();
    let mut newest_trailer = None;
    let mut seen = HashSet::new();
    let mut next = Some(startxref);

    while let Some(offset) = next {
        if !seen.insert(offset) {
            warn!(
                domain = "pdf.xref",
                kind = "xref_loop_detected",
                offset = offset,
                "Detected xref loop"
            );
            break;
        }
        if offset >= bytes.len() {
            return Err(malformed(offset, "cross-reference offset beyond end of file"));
        }
        let (section, trailer) = parse_xref_section(bytes, offset)?;
        debug!(domain = "pdf.xref", offset = offset, entries = section.len(), "Parsed xref table");

        if trailer.has(b"XRefStm") {
            return Err(AttachError::Unsupported(
                "hybrid-reference files with /XRefStm".into(),
            ));
        }

        // Sections are visited newest first; older entries never override.
        for (num, entry) in section {
            entries.entry(num).or_insert(entry);
        }
        next = match trailer.get(b"Prev") {
            Some(Object::Integer(prev)) if *prev >= 0 => usize::try_from(*prev).ok(),
            _ => None,
        };
        if newest_trailer.is_none() {
            newest_trailer = Some(trailer);
        }
    }

    let trailer = newest_trailer
        .ok_or_else(|| AttachError::MalformedDocument("no trailer dictionary".into()))?;
    Ok(XrefTable { entries, trailer, startxref })
}

fn parse_xref_section(
    bytes: &[u8],
    offset: usize,
) -> Result<(BTreeMap<u32, XrefEntry>, Dictionary)> {
    let mut cur = Cursor::new(bytes, offset);
    cur.skip_ws_and_comments();
    if !cur.consume_token(b"xref") {
        if let Ok((_, Object::Stream(stream), _)) = parse_indirect_object_at(bytes, offset, None) {
            if stream.dict.has_type(b"XRef") {
                return Err(AttachError::Unsupported("cross-reference streams".into()));
            }
        }
        return Err(malformed(offset, "startxref does not point at a cross-reference table"));
    }

    let mut section = BTreeMap::new();
    loop {
        cur.skip_ws_and_comments();
        if cur.consume_token(b"trailer") {
            break;
        }
        let header = cur.pos;
        let first = cur
            .read_unsigned()
            .ok_or_else(|| malformed(header, "expected xref subsection header or trailer"))?;
        cur.skip_ws_and_comments();
        let count = cur
            .read_unsigned()
            .ok_or_else(|| malformed(header, "xref subsection without entry count"))?;

        for i in 0..count {
            let entry_pos = cur.pos;
            cur.skip_ws_and_comments();
            let field1 = cur.read_unsigned();
            cur.skip_ws_and_comments();
            let field2 = cur.read_unsigned().and_then(|g| u16::try_from(g).ok());
            cur.skip_ws_and_comments();
            let kind = cur.consume();
            let (Some(field1), Some(generation)) = (field1, field2) else {
                return Err(malformed(entry_pos, "truncated xref entry"));
            };
            let num = first
                .checked_add(i)
                .and_then(|num| u32::try_from(num).ok())
                .filter(|num| *num <= MAX_OBJECT_NUMBER)
                .ok_or_else(|| malformed(entry_pos, "object number out of range"))?;
            let entry = match kind {
                Some(b'n') if field1 == 0 => {
                    warn!(
                        domain = "pdf.xref",
                        kind = "xref_zero_offset",
                        obj = num,
                        "In-use entry at offset 0 treated as free"
                    );
                    XrefEntry::Free { next: 0, generation }
                }
                Some(b'n') => XrefEntry::InUse {
                    offset: usize::try_from(field1)
                        .map_err(|_| malformed(entry_pos, "offset overflow"))?,
                    generation,
                },
                Some(b'f') => {
                    XrefEntry::Free { next: u32::try_from(field1).unwrap_or(0), generation }
                }
                _ => return Err(malformed(entry_pos, "xref entry type must be 'n' or 'f'")),
            };
            section.insert(num, entry);
        }
    }

    let trailer = Parser::new(bytes, cur.pos).parse_dict()?;
    Ok((section, trailer))
}

/// Rebuild the object index by scanning for `N G obj` headers.
///
/// The trailer comes from the last `trailer` keyword in the file, or is
/// synthesized around the first catalog object found.
pub(crate) fn rebuild_by_scan(bytes: &[u8]) -> Result<XrefTable> {
    let headers = scan_object_headers(bytes);
    let mut entries = BTreeMap::new();
    for ((num, generation), offset) in &headers {
        // Later definitions win, as with incremental updates.
        entries.insert(*num, XrefEntry::InUse { offset: *offset, generation: *generation });
    }
    warn!(
        domain = "pdf.xref",
        kind = "xref_rebuilt",
        objects = entries.len(),
        "Rebuilt cross-reference index by scanning object headers"
    );

    let mut trailer = memchr::memmem::rfind(bytes, b"trailer")
        .and_then(|pos| Parser::new(bytes, pos + b"trailer".len()).parse_dict().ok())
        .unwrap_or_default();
    trailer.remove(b"Prev");

    let root_ok = matches!(
        trailer.get(b"Root"),
        Some(Object::Reference((num, _))) if entries.contains_key(num)
    );
    if !root_ok {
        let catalog = headers.iter().rev().find_map(|(id, offset)| {
            match parse_indirect_object_at(bytes, *offset, None) {
                Ok((_, Object::Dictionary(d), _)) if d.has_type(b"Catalog") => Some(*id),
                _ => None,
            }
        });
        let catalog = catalog
            .ok_or_else(|| AttachError::MalformedDocument("no document catalog found".into()))?;
        trailer.set("Root", Object::Reference(catalog));
    }
    let size = entries.keys().next_back().map_or(1, |max| i64::from(*max) + 1);
    trailer.set("Size", Object::Integer(size));

    Ok(XrefTable { entries, trailer, startxref: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_whitespace_variance_in_entries() {
        let data = b"xref\r\n0  3\r\n0000000000 65535 f\r\n0000000017 00000 n\n  0000000081 00000 n \ntrailer\n<< /Size 3 /Root 1 0 R >>";
        let (section, trailer) = parse_xref_section(data, 0).unwrap();
        assert_eq!(section.len(), 3);
        assert_eq!(section[&1], XrefEntry::InUse { offset: 17, generation: 0 });
        assert_eq!(section[&2], XrefEntry::InUse { offset: 81, generation: 0 });
        assert_eq!(trailer.get(b"Root"), Some(&Object::Reference((1, 0))));
    }

    #[test]
    fn multiple_subsections() {
        let data = b"xref\n0 1\n0000000000 65535 f \n4 2\n0000000100 00000 n \n0000000200 00001 n \ntrailer<</Size 6>>";
        let (section, _) = parse_xref_section(data, 0).unwrap();
        assert_eq!(section[&5], XrefEntry::InUse { offset: 200, generation: 1 });
        assert!(!section.contains_key(&1));
    }

    #[test]
    fn subsection_past_object_number_limit_is_malformed() {
        let data = b"xref\n8388607 2\n0000000100 00000 n \n0000000200 00000 n \ntrailer<</Size 2>>";
        assert!(matches!(parse_xref_section(data, 0), Err(AttachError::MalformedDocument(_))));

        let data = b"xref\n18446744073709551615 2\n0000000100 00000 n \n0000000200 00000 n \ntrailer<<>>";
        assert!(matches!(parse_xref_section(data, 0), Err(AttachError::MalformedDocument(_))));
    }

    #[test]
    fn finds_last_startxref() {
        let data = b"...startxref\n10\n%%EOF\n...startxref\r\n  42\r\n%%EOF\r\n";
        assert_eq!(find_startxref(data).unwrap(), 42);
    }

    #[test]
    fn missing_startxref_is_malformed() {
        assert!(matches!(find_startxref(b"%PDF-1.4\n"), Err(AttachError::MalformedDocument(_))));
    }

    #[test]
    fn xref_stream_is_unsupported() {
        let data = b"7 0 obj\n<< /Type /XRef /Size 8 /W [1 2 1] /Length 0 >>\nstream\n\nendstream\nendobj\n";
        let err = parse_xref_section(data, 0).unwrap_err();
        assert!(matches!(err, AttachError::Unsupported(_)));
    }

    #[test]
    fn newest_section_wins_along_prev_chain() {
        let old = b"xref\n0 2\n0000000000 65535 f \n0000000010 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R >>\n";
        let mut data = old.to_vec();
        let newer_at = data.len();
        data.extend_from_slice(
            b"xref\n1 1\n0000000099 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R /Prev 0 >>\n",
        );
        let table = read_xref_chain(&data, newer_at).unwrap();
        assert_eq!(table.entries[&1], XrefEntry::InUse { offset: 99, generation: 0 });
        assert_eq!(table.trailer.get(b"Prev"), Some(&Object::Integer(0)));
        assert_eq!(table.startxref, newer_at);
    }
}
