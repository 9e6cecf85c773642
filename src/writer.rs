//! Serializing a [`Document`] back to PDF bytes.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::document::{Document, Source};
use crate::object::{Dictionary, Object, ObjectId, Stream, StringFormat};
use crate::{AttachConfig, AttachError, Result, WriteMode};

/// Embedded files need at least this header version.
const MIN_VERSION: (u32, u32) = (1, 4);
const BINARY_COMMENT: &[u8] = b"%\xE2\xE3\xCF\xD3\n";

// ── Writer ────────────────────────────────────────────────────────────────────

/// Turns a [`Document`] into bytes, either as a full rewrite or as an
/// incremental update appended to the bytes it was loaded from.
///
/// ```no_run
/// use attachpdf::{AttachConfig, Document, Writer};
///
/// let config = AttachConfig::default();
/// let doc = Document::load("in.pdf", &config).unwrap();
/// Writer::new(&config).save(&doc, "out.pdf").unwrap();
/// ```
pub struct Writer<'a> {
    config: &'a AttachConfig,
}

impl<'a> Writer<'a> {
    pub fn new(config: &'a AttachConfig) -> Self {
        Self { config }
    }

    /// Serialize `doc` according to `config.write_mode`.
    pub fn write(&self, doc: &Document) -> Result<Vec<u8>> {
        if self.config.write_mode == WriteMode::Incremental {
            match doc.source() {
                Some(source) if source.repaired => {
                    warn!(
                        domain = "pdf.writer",
                        kind = "incremental_fallback",
                        reason = "repaired",
                        "Source was repaired; writing a full rewrite"
                    );
                }
                // Offsets in the old sections are relative to the header.
                Some(source) if source.header_pos > 0 => {
                    warn!(
                        domain = "pdf.writer",
                        kind = "incremental_fallback",
                        reason = "header_offset",
                        offset = source.header_pos,
                        "Source has junk before its header; writing a full rewrite"
                    );
                }
                Some(source) => return self.write_incremental(doc, source),
                None => {
                    warn!(
                        domain = "pdf.writer",
                        kind = "incremental_fallback",
                        reason = "no_source",
                        "No source bytes; writing a full rewrite"
                    );
                }
            }
        }
        self.write_full(doc)
    }

    /// Serialize `doc` and place it at `path` atomically.
    ///
    /// The bytes go to a temporary file in the destination directory first,
    /// so a failure never leaves a partial file at `path`.
    pub fn save<P: AsRef<Path>>(&self, doc: &Document, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.write(doc)?;
        write_atomic(path, &bytes).map_err(|source| AttachError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            domain = "pdf.writer",
            path = %path.display(),
            bytes = bytes.len(),
            "Saved document"
        );
        Ok(())
    }

    // ── Full rewrite ──────────────────────────────────────────────────────────

    fn write_full(&self, doc: &Document) -> Result<Vec<u8>> {
        doc.catalog_id()?;
        let reachable = (!self.config.keep_unreachable).then(|| doc.reachable_ids());

        // One entry per object number; the highest generation wins.
        let mut emitted: BTreeMap<u32, (u16, &Object)> = BTreeMap::new();
        for ((num, generation), obj) in doc.objects() {
            let pruned = reachable.as_ref().is_some_and(|keep| !keep.contains(&(num, generation)));
            if num == 0 || pruned {
                continue;
            }
            emitted.insert(num, (generation, obj));
        }

        let mut out = Vec::new();
        out.extend_from_slice(format!("%PDF-{}\n", output_version(doc.version())).as_bytes());
        out.extend_from_slice(BINARY_COMMENT);

        let mut offsets: BTreeMap<u32, (usize, u16)> = BTreeMap::new();
        for (num, (generation, obj)) in &emitted {
            offsets.insert(*num, (out.len(), *generation));
            write_indirect(&mut out, (*num, *generation), obj);
        }

        let size = emitted.keys().next_back().map_or(1, |max| max + 1);
        let xref_offset = out.len();
        out.extend_from_slice(format!("xref\n0 {size}\n").as_bytes());

        let free: Vec<u32> = (1..size).filter(|n| !offsets.contains_key(n)).collect();
        let mut next_free = free.iter().copied().chain(std::iter::once(0));
        let head = next_free.next().unwrap_or(0);
        out.extend_from_slice(format!("{head:010} 65535 f \n").as_bytes());
        for num in 1..size {
            match offsets.get(&num) {
                Some((offset, generation)) => {
                    out.extend_from_slice(format!("{offset:010} {generation:05} n \n").as_bytes());
                }
                None => {
                    let next = next_free.next().unwrap_or(0);
                    out.extend_from_slice(format!("{next:010} 00000 f \n").as_bytes());
                }
            }
        }

        let mut trailer = Dictionary::new();
        trailer.set("Size", Object::Integer(i64::from(size)));
        let kept: [&[u8]; 3] = [b"Root", b"Info", b"ID"];
        for key in kept {
            if let Some(value) = doc.trailer().get(key) {
                trailer.set(key, value.clone());
            }
        }
        write_trailer(&mut out, &trailer, xref_offset);

        debug!(
            domain = "pdf.writer",
            mode = "full",
            objects = emitted.len(),
            dropped = doc.object_count() - emitted.len(),
            bytes = out.len(),
            "Serialized document"
        );
        Ok(out)
    }

    // ── Incremental update ────────────────────────────────────────────────────

    fn write_incremental(&self, doc: &Document, source: &Source) -> Result<Vec<u8>> {
        let catalog = doc.catalog_id()?;
        let mut changed: BTreeSet<ObjectId> = doc
            .modified_ids()
            .iter()
            .copied()
            .filter(|id| id.0 != 0 && doc.get_object(*id).is_ok())
            .collect();
        if changed.is_empty() {
            debug!(domain = "pdf.writer", mode = "incremental", "No changes to append");
            return Ok(source.bytes.clone());
        }

        let mut out = source.bytes.clone();
        if !matches!(out.last(), Some(b'\n' | b'\r')) {
            out.push(b'\n');
        }

        // The header stays as it was, so the catalog carries the version.
        let needs_version = doc.version() != output_version(doc.version());
        if needs_version {
            changed.insert(catalog);
        }
        let mut offsets: BTreeMap<u32, (usize, u16)> = BTreeMap::new();
        for id in &changed {
            let obj = doc.get_object(*id)?;
            offsets.insert(id.0, (out.len(), id.1));
            if needs_version && *id == catalog {
                let mut obj = obj.clone();
                if let Some(dict) = obj.as_dict_mut() {
                    dict.set("Version", Object::name(output_version(doc.version()).into_owned()));
                }
                write_indirect(&mut out, *id, &obj);
            } else {
                write_indirect(&mut out, *id, obj);
            }
        }

        let xref_offset = out.len();
        out.extend_from_slice(b"xref\n");
        for run in contiguous_runs(offsets.keys().copied()) {
            out.extend_from_slice(format!("{} {}\n", run.0, run.1).as_bytes());
            for num in run.0..run.0 + run.1 {
                if let Some((offset, generation)) = offsets.get(&num) {
                    out.extend_from_slice(format!("{offset:010} {generation:05} n \n").as_bytes());
                }
            }
        }

        let previous_size = doc.trailer().get(b"Size").and_then(Object::as_i64).unwrap_or(0);
        let size = previous_size.max(i64::from(doc.max_object_number()) + 1);
        let mut trailer = doc.trailer().clone();
        trailer.remove(b"XRefStm");
        trailer.set("Size", Object::Integer(size));
        trailer.set("Prev", Object::Integer(source.startxref as i64));
        write_trailer(&mut out, &trailer, xref_offset);

        debug!(
            domain = "pdf.writer",
            mode = "incremental",
            objects = changed.len(),
            prev = source.startxref,
            bytes = out.len() - source.bytes.len(),
            "Appended update"
        );
        Ok(out)
    }
}

/// `(first, count)` for each run of consecutive numbers.
fn contiguous_runs(nums: impl Iterator<Item = u32>) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for num in nums {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == num => *count += 1,
            _ => runs.push((num, 1)),
        }
    }
    runs
}

/// The header version to write: `version`, or 1.4 when it is older.
fn output_version(version: &str) -> Cow<'_, str> {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next().flatten();
    let minor = parts.next().flatten().unwrap_or(0);
    match major {
        Some(major) if (major, minor) >= MIN_VERSION => Cow::Borrowed(version),
        _ => Cow::Owned(format!("{}.{}", MIN_VERSION.0, MIN_VERSION.1)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ── Object serialization ──────────────────────────────────────────────────────

fn write_trailer(out: &mut Vec<u8>, trailer: &Dictionary, xref_offset: usize) {
    out.extend_from_slice(b"trailer\n");
    write_dict(out, trailer, None);
    out.extend_from_slice(format!("\nstartxref\n{xref_offset}\n%%EOF\n").as_bytes());
}

fn write_indirect(out: &mut Vec<u8>, id: ObjectId, obj: &Object) {
    trace!(
        domain = "pdf.writer",
        obj = id.0,
        generation = id.1,
        offset = out.len(),
        kind = obj.type_name(),
        "Writing object"
    );
    out.extend_from_slice(format!("{} {} obj\n", id.0, id.1).as_bytes());
    write_object(out, obj);
    out.extend_from_slice(b"\nendobj\n");
}

pub(crate) fn write_object(out: &mut Vec<u8>, obj: &Object) {
    match obj {
        Object::Null => out.extend_from_slice(b"null"),
        Object::Boolean(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Object::Integer(i) => out.extend_from_slice(i.to_string().as_bytes()),
        Object::Real(r) => out.extend_from_slice(format_real(*r).as_bytes()),
        Object::String(bytes, StringFormat::Literal) => write_literal_string(out, bytes),
        Object::String(bytes, StringFormat::Hexadecimal) => {
            out.push(b'<');
            for b in bytes {
                out.extend_from_slice(format!("{b:02X}").as_bytes());
            }
            out.push(b'>');
        }
        Object::Name(name) => write_name(out, name),
        Object::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                write_object(out, item);
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dict(out, dict, None),
        Object::Stream(stream) => write_stream(out, stream),
        Object::Reference((num, generation)) => {
            out.extend_from_slice(format!("{num} {generation} R").as_bytes());
        }
    }
}

/// Write `dict`; with `length` set, `/Length` is written with that value
/// (appended if the dictionary has none).
fn write_dict(out: &mut Vec<u8>, dict: &Dictionary, length: Option<usize>) {
    out.extend_from_slice(b"<<");
    let mut length_written = false;
    for (key, value) in dict.iter() {
        out.push(b' ');
        write_name(out, key);
        out.push(b' ');
        match length {
            Some(len) if key == b"Length" => {
                out.extend_from_slice(len.to_string().as_bytes());
                length_written = true;
            }
            _ => write_object(out, value),
        }
    }
    if let (Some(len), false) = (length, length_written) {
        out.extend_from_slice(format!(" /Length {len}").as_bytes());
    }
    out.extend_from_slice(b" >>");
}

fn write_stream(out: &mut Vec<u8>, stream: &Stream) {
    write_dict(out, &stream.dict, Some(stream.content.len()));
    out.extend_from_slice(b"\nstream\n");
    out.extend_from_slice(&stream.content);
    out.extend_from_slice(b"\nendstream");
}

fn write_literal_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'(');
    for &b in bytes {
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x20..=0x7e => out.push(b),
            _ => out.extend_from_slice(format!("\\{b:03o}").as_bytes()),
        }
    }
    out.push(b')');
}

fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    out.push(b'/');
    for &b in name {
        let plain = (0x21..=0x7e).contains(&b)
            && !matches!(b, b'#' | b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%');
        if plain {
            out.push(b);
        } else {
            out.extend_from_slice(format!("#{b:02X}").as_bytes());
        }
    }
}

fn format_real(r: f64) -> String {
    if !r.is_finite() {
        return "0".into();
    }
    let s = format!("{r:.6}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    match s {
        "-0" | "" => "0".into(),
        s => s.to_string(),
    }
}
