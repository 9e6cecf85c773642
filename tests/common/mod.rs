// Hand-assembled PDF fixtures for the integration tests.
//
// Every fixture is built from object bodies with the cross-reference offsets
// computed on the fly, so the inputs do not depend on any PDF library.

#![allow(dead_code)]

use std::collections::BTreeMap;

pub const CATALOG: &str = "<< /Type /Catalog /Pages 2 0 R >>";
pub const PAGES: &str = "<< /Type /Pages /Kids [3 0 R] /Count 1 >>";
pub const PAGE: &str = "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>";

/// Knobs for [`build_pdf`]. The default is a clean file with `\n` line ends.
#[derive(Default)]
pub struct Options {
    pub eol: Option<&'static str>,
    /// Bytes placed before `%PDF-`; offsets stay relative to the header.
    pub junk: &'static [u8],
    /// Added to every in-use xref offset.
    pub offset_skew: usize,
    /// Replaces the real `startxref` value.
    pub startxref: Option<usize>,
    pub trailer_extra: &'static str,
}

pub fn build_pdf(objects: &[(u32, &str)], opts: &Options) -> Vec<u8> {
    let eol = opts.eol.unwrap_or("\n");
    let entry_end = if eol == "\r\n" { "\r\n" } else { " \n" };

    let mut out = opts.junk.to_vec();
    let base = out.len();
    out.extend_from_slice(format!("%PDF-1.4{eol}").as_bytes());

    let mut offsets = BTreeMap::new();
    for (num, body) in objects {
        offsets.insert(*num, out.len() - base);
        out.extend_from_slice(format!("{num} 0 obj{eol}{body}{eol}endobj{eol}").as_bytes());
    }

    let size = offsets.keys().next_back().map_or(1, |max| max + 1);
    let xref = out.len() - base;
    out.extend_from_slice(format!("xref{eol}0 {size}{eol}").as_bytes());
    for num in 0..size {
        let entry = match offsets.get(&num) {
            Some(offset) => format!("{:010} 00000 n{entry_end}", offset + opts.offset_skew),
            None if num == 0 => format!("0000000000 65535 f{entry_end}"),
            None => format!("0000000000 00001 f{entry_end}"),
        };
        out.extend_from_slice(entry.as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer{eol}<< /Size {size} /Root 1 0 R {} >>{eol}startxref{eol}{}{eol}%%EOF{eol}",
            opts.trailer_extra,
            opts.startxref.unwrap_or(xref)
        )
        .as_bytes(),
    );
    out
}

pub fn startxref_of(bytes: &[u8]) -> usize {
    let text = String::from_utf8_lossy(bytes);
    let pos = text.rfind("startxref").unwrap();
    text[pos + "startxref".len()..]
        .split_whitespace()
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub fn minimal_pdf() -> Vec<u8> {
    build_pdf(&[(1, CATALOG), (2, PAGES), (3, PAGE)], &Options::default())
}

pub fn crlf_pdf() -> Vec<u8> {
    let opts = Options { eol: Some("\r\n"), ..Default::default() };
    build_pdf(
        &[
            (1, "<<  /Type   /Catalog\r\n/Pages 2 0 R  >>"),
            (2, PAGES),
            (3, PAGE),
        ],
        &opts,
    )
}

pub fn junk_prefixed_pdf() -> Vec<u8> {
    let opts = Options { junk: b"Content-Type: application/pdf\r\n\r\n", ..Default::default() };
    build_pdf(&[(1, CATALOG), (2, PAGES), (3, PAGE)], &opts)
}

/// Every xref offset is a few bytes off.
pub fn broken_offsets_pdf() -> Vec<u8> {
    let opts = Options { offset_skew: 5, ..Default::default() };
    build_pdf(&[(1, CATALOG), (2, PAGES), (3, PAGE)], &opts)
}

/// `startxref` points past the end of the file.
pub fn stale_startxref_pdf() -> Vec<u8> {
    let opts = Options { startxref: Some(999_999), ..Default::default() };
    build_pdf(&[(1, CATALOG), (2, PAGES), (3, PAGE)], &opts)
}

/// One attachment `old.txt` plus a `/Dests` name tree.
pub fn pdf_with_attachment() -> Vec<u8> {
    build_pdf(
        &[
            (1, "<< /Type /Catalog /Pages 2 0 R /Names 4 0 R >>"),
            (2, PAGES),
            (3, PAGE),
            (4, "<< /Dests 5 0 R /EmbeddedFiles 6 0 R >>"),
            (5, "<< /Names [(chapter1) [3 0 R /Fit]] >>"),
            (6, "<< /Names [(old.txt) 7 0 R] >>"),
            (7, "<< /Type /Filespec /F (old.txt) /UF (old.txt) /EF << /F 8 0 R >> >>"),
            (8, "<< /Type /EmbeddedFile /Length 3 >>\nstream\nold\nendstream"),
        ],
        &Options::default(),
    )
}

/// `minimal_pdf` plus an incremental update that rewrites the catalog.
pub fn incrementally_updated_pdf() -> Vec<u8> {
    let mut out = minimal_pdf();
    let prev = startxref_of(&out);
    let catalog_at = out.len();
    out.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R /PageMode /UseOutlines >>\nendobj\n");
    let xref = out.len();
    out.extend_from_slice(
        format!(
            "xref\n1 1\n{catalog_at:010} 00000 n \ntrailer\n<< /Size 4 /Root 1 0 R /Prev {prev} >>\nstartxref\n{xref}\n%%EOF\n"
        )
        .as_bytes(),
    );
    out
}

pub fn xref_stream_pdf() -> Vec<u8> {
    let mut out = b"%PDF-1.5\n".to_vec();
    for (num, body) in [(1, CATALOG), (2, PAGES), (3, PAGE)] {
        out.extend_from_slice(format!("{num} 0 obj\n{body}\nendobj\n").as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(
        b"4 0 obj\n<< /Type /XRef /Size 5 /W [1 2 1] /Root 1 0 R /Length 0 >>\nstream\n\nendstream\nendobj\n",
    );
    out.extend_from_slice(format!("startxref\n{xref}\n%%EOF\n").as_bytes());
    out
}

pub fn encrypted_pdf() -> Vec<u8> {
    let opts = Options { trailer_extra: "/Encrypt 4 0 R", ..Default::default() };
    build_pdf(
        &[
            (1, CATALOG),
            (2, PAGES),
            (3, PAGE),
            (4, "<< /Filter /Standard /V 1 /R 2 /O <00> /U <00> /P -4 >>"),
        ],
        &opts,
    )
}

/// Deterministic pseudo-random bytes.
pub fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

// ── Reading output with lopdf ─────────────────────────────────────────────────

/// Walks `/Names/EmbeddedFiles` with lopdf and returns `(key, content)` pairs
/// in tree order.
pub fn lopdf_attachments(bytes: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let doc = lopdf::Document::load_mem(bytes).expect("lopdf rejected the output");
    let catalog = doc.catalog().unwrap();
    let names = resolve_dict(&doc, catalog.get(b"Names").unwrap());
    let tree = resolve_dict(&doc, names.get(b"EmbeddedFiles").unwrap());
    let mut out = Vec::new();
    collect_lopdf(&doc, tree, &mut out);
    out
}

fn resolve_dict<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> &'a lopdf::Dictionary {
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).unwrap().as_dict().unwrap(),
        other => other.as_dict().unwrap(),
    }
}

fn collect_lopdf(
    doc: &lopdf::Document,
    node: &lopdf::Dictionary,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) {
    if let Ok(names) = node.get(b"Names") {
        for pair in names.as_array().unwrap().chunks(2) {
            let key = pair[0].as_str().unwrap().to_vec();
            let spec = resolve_dict(doc, &pair[1]);
            let ef = resolve_dict(doc, spec.get(b"EF").unwrap());
            let stream_id = ef.get(b"F").unwrap().as_reference().unwrap();
            let stream = doc.get_object(stream_id).unwrap().as_stream().unwrap();
            out.push((key, stream.content.clone()));
        }
    }
    if let Ok(kids) = node.get(b"Kids") {
        for kid in kids.as_array().unwrap() {
            collect_lopdf(doc, resolve_dict(doc, kid), out);
        }
    }
}
