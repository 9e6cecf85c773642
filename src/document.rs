use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use tracing::{debug, warn};

use crate::object::{Dictionary, Object, ObjectId, MAX_OBJECT_NUMBER};
use crate::parser::{malformed, parse_indirect_object_at, scan_object_headers};
use crate::xref::{find_startxref, read_xref_chain, rebuild_by_scan, XrefEntry, XrefTable};
use crate::{AttachConfig, AttachError, Result};

/// The `%PDF-` marker may be preceded by this much junk.
const HEADER_WINDOW: usize = 1024;
/// Bound on reference-to-reference chains followed by [`Document::resolve`].
const MAX_RESOLVE_HOPS: usize = 32;

/// The bytes a document was loaded from, kept for incremental writes.
#[derive(Debug, Clone)]
pub(crate) struct Source {
    pub(crate) bytes: Vec<u8>,
    pub(crate) startxref: usize,
    pub(crate) repaired: bool,
    /// Bytes of junk before `%PDF-`.
    pub(crate) header_pos: usize,
}

// ── Document ──────────────────────────────────────────────────────────────────

/// An in-memory PDF: an arena of indirect objects keyed by [`ObjectId`] plus
/// the trailer dictionary.
///
/// # Loading
///
/// ```no_run
/// use attachpdf::{AttachConfig, Document};
///
/// let doc = Document::load("input.pdf", &AttachConfig::default()).unwrap();
/// println!("PDF {} with {} objects", doc.version(), doc.object_count());
/// ```
#[derive(Debug, Clone)]
pub struct Document {
    version: String,
    objects: BTreeMap<ObjectId, Object>,
    trailer: Dictionary,
    source: Option<Source>,
    modified: BTreeSet<ObjectId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty PDF 1.7 document without objects or trailer entries.
    pub fn new() -> Self {
        Self {
            version: "1.7".into(),
            objects: BTreeMap::new(),
            trailer: Dictionary::new(),
            source: None,
            modified: BTreeSet::new(),
        }
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    /// Read and parse the PDF at `path`.
    pub fn load<P: AsRef<Path>>(path: P, config: &AttachConfig) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::load_bytes(bytes, config)
    }

    /// Parse a PDF held in memory.
    pub fn load_mem(bytes: &[u8], config: &AttachConfig) -> Result<Self> {
        Self::load_bytes(bytes.to_vec(), config)
    }

    /// Parse a PDF, taking ownership of the buffer.
    pub fn load_bytes(bytes: Vec<u8>, config: &AttachConfig) -> Result<Self> {
        let (header_pos, version) = locate_header(&bytes)?;

        let (table, mut repaired) = match read_table(&bytes, header_pos) {
            Ok(table) => (table, false),
            Err(e @ AttachError::Unsupported(_)) => return Err(e),
            Err(e) if config.strict_xref => return Err(e),
            Err(e) => {
                warn!(
                    domain = "pdf.document",
                    kind = "xref_unreadable",
                    error = %e,
                    "Falling back to object scan"
                );
                (rebuild_by_scan(&bytes)?, true)
            }
        };

        if table.trailer.has(b"Encrypt") {
            return Err(AttachError::Unsupported("encrypted documents".into()));
        }

        let lengths = |id: ObjectId| -> Option<usize> {
            let XrefEntry::InUse { offset, .. } = table.entries.get(&id.0)? else {
                return None;
            };
            match parse_indirect_object_at(&bytes, *offset, None) {
                Ok((_, Object::Integer(n), _)) => usize::try_from(n).ok(),
                _ => None,
            }
        };

        let mut scanned: Option<HashMap<u32, usize>> = None;
        let mut objects = BTreeMap::new();
        for (num, offset, generation) in table.in_use() {
            let mut candidates = vec![offset];
            if header_pos > 0 {
                candidates.push(offset + header_pos);
            }
            let mut loaded = candidates
                .into_iter()
                .find_map(|off| load_object(&bytes, off, num, &lengths));

            if loaded.is_none() && !config.strict_xref {
                let index = scanned.get_or_insert_with(|| {
                    scan_object_headers(&bytes)
                        .into_iter()
                        .map(|((n, _), off)| (n, off))
                        .collect()
                });
                if let Some(off) = index.get(&num) {
                    loaded = load_object(&bytes, *off, num, &lengths);
                    if loaded.is_some() {
                        warn!(
                            domain = "pdf.document",
                            kind = "xref_offset_wrong",
                            obj = num,
                            offset = offset,
                            actual = *off,
                            "Object found away from its xref offset"
                        );
                        repaired = true;
                    }
                }
            }

            match loaded {
                Some((id, object)) => {
                    if id.1 != generation {
                        warn!(
                            domain = "pdf.document",
                            kind = "generation_mismatch",
                            obj = num,
                            xref = generation,
                            actual = id.1,
                            "Generation differs from xref entry"
                        );
                    }
                    objects.insert(id, object);
                }
                None if config.strict_xref => {
                    return Err(malformed(
                        offset,
                        format!("object {num} not found at its xref offset"),
                    ));
                }
                None => {
                    warn!(
                        domain = "pdf.document",
                        kind = "object_unreadable",
                        obj = num,
                        offset = offset,
                        "Skipping unreadable object"
                    );
                }
            }
        }

        let XrefTable { trailer, startxref, .. } = table;
        let doc = Self {
            version,
            objects,
            trailer,
            source: Some(Source { bytes, startxref, repaired, header_pos }),
            modified: BTreeSet::new(),
        };

        let root = doc.catalog_id()?;
        if doc.get_object(root).ok().and_then(Object::as_dict).is_none() {
            return Err(AttachError::MalformedDocument(format!(
                "trailer /Root {} {} R does not resolve to a dictionary",
                root.0, root.1
            )));
        }

        debug!(
            domain = "pdf.document",
            version = %doc.version,
            objects = doc.objects.len(),
            repaired = repaired,
            "Loaded document"
        );
        Ok(doc)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The header version, e.g. `"1.4"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version<S: Into<String>>(&mut self, version: S) {
        self.version = version.into();
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.trailer
    }

    pub fn trailer_mut(&mut self) -> &mut Dictionary {
        &mut self.trailer
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.objects.iter().map(|(id, obj)| (*id, obj))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// `true` when the cross-reference data had to be reconstructed.
    pub fn is_repaired(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.repaired)
    }

    pub(crate) fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Objects added or handed out mutably since loading.
    pub(crate) fn modified_ids(&self) -> &BTreeSet<ObjectId> {
        &self.modified
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    pub fn get_object(&self, id: ObjectId) -> Result<&Object> {
        self.objects.get(&id).ok_or(AttachError::BrokenReference(id))
    }

    pub fn get_object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        let obj = self.objects.get_mut(&id).ok_or(AttachError::BrokenReference(id))?;
        self.modified.insert(id);
        Ok(obj)
    }

    pub fn get_dict(&self, id: ObjectId) -> Result<&Dictionary> {
        let obj = self.get_object(id)?;
        obj.as_dict().ok_or_else(|| not_a(id, "dictionary", obj))
    }

    pub fn get_dict_mut(&mut self, id: ObjectId) -> Result<&mut Dictionary> {
        let obj = self.get_object_mut(id)?;
        let kind = obj.type_name();
        obj.as_dict_mut().ok_or_else(|| {
            AttachError::MalformedDocument(format!(
                "object {} {} is a {kind}, expected a dictionary",
                id.0, id.1
            ))
        })
    }

    /// Follow `obj` through references until a direct object is reached.
    pub fn resolve<'a>(&'a self, mut obj: &'a Object) -> Result<&'a Object> {
        for _ in 0..MAX_RESOLVE_HOPS {
            match obj {
                Object::Reference(id) => obj = self.get_object(*id)?,
                direct => return Ok(direct),
            }
        }
        Err(AttachError::MalformedDocument("reference chain too long".into()))
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    /// Highest object number in use, counting the trailer's `/Size`.
    pub fn max_object_number(&self) -> u32 {
        let in_arena = self.objects.keys().next_back().map_or(0, |(num, _)| *num);
        let by_size = match self.trailer.get(b"Size") {
            Some(Object::Integer(size)) => u32::try_from(size.saturating_sub(1)).unwrap_or(0),
            _ => 0,
        };
        in_arena.max(by_size)
    }

    /// Store `object` under a new id one past [`max_object_number`],
    /// generation 0.
    ///
    /// Fails with [`AttachError::MalformedDocument`] once the next number
    /// would exceed [`MAX_OBJECT_NUMBER`].
    ///
    /// [`max_object_number`]: Document::max_object_number
    pub fn add_object<O: Into<Object>>(&mut self, object: O) -> Result<ObjectId> {
        self.ensure_capacity(1)?;
        let id = (self.max_object_number() + 1, 0);
        self.objects.insert(id, object.into());
        self.modified.insert(id);
        debug!(domain = "pdf.document", obj = id.0, "Allocated object");
        Ok(id)
    }

    /// Check that `count` more objects can be allocated.
    pub fn ensure_capacity(&self, count: usize) -> Result<()> {
        let max = self.max_object_number();
        let fits = u32::try_from(count)
            .ok()
            .and_then(|count| max.checked_add(count))
            .is_some_and(|last| last <= MAX_OBJECT_NUMBER);
        if fits {
            Ok(())
        } else {
            Err(AttachError::MalformedDocument(format!(
                "cannot allocate {count} object(s) past object number {max}"
            )))
        }
    }

    /// Store `object` under `id`, replacing any previous object.
    pub fn set_object<O: Into<Object>>(&mut self, id: ObjectId, object: O) {
        self.objects.insert(id, object.into());
        self.modified.insert(id);
    }

    // ── Catalog ───────────────────────────────────────────────────────────────

    pub fn catalog_id(&self) -> Result<ObjectId> {
        self.trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .ok_or_else(|| AttachError::MalformedDocument("trailer has no /Root reference".into()))
    }

    pub fn catalog(&self) -> Result<&Dictionary> {
        self.get_dict(self.catalog_id()?)
    }

    pub fn catalog_mut(&mut self) -> Result<&mut Dictionary> {
        let id = self.catalog_id()?;
        self.get_dict_mut(id)
    }

    // ── Reachability ──────────────────────────────────────────────────────────

    /// Every object reachable from the trailer.
    pub fn reachable_ids(&self) -> BTreeSet<ObjectId> {
        let mut seen = BTreeSet::new();
        let mut stack = Vec::new();
        for (_, value) in self.trailer.iter() {
            collect_references(value, &mut stack);
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(obj) = self.objects.get(&id) {
                collect_references(obj, &mut stack);
            }
        }
        seen.retain(|id| self.objects.contains_key(id));
        seen
    }

    /// Drop objects not reachable from the trailer; returns how many went.
    pub fn prune_unreachable(&mut self) -> usize {
        let keep = self.reachable_ids();
        let before = self.objects.len();
        self.objects.retain(|id, _| keep.contains(id));
        let removed = before - self.objects.len();
        if removed > 0 {
            debug!(domain = "pdf.document", removed = removed, "Pruned unreachable objects");
        }
        removed
    }
}

fn not_a(id: ObjectId, expected: &str, obj: &Object) -> AttachError {
    AttachError::MalformedDocument(format!(
        "object {} {} is a {}, expected a {expected}",
        id.0,
        id.1,
        obj.type_name()
    ))
}

fn collect_references(obj: &Object, out: &mut Vec<ObjectId>) {
    match obj {
        Object::Reference(id) => out.push(*id),
        Object::Array(items) => items.iter().for_each(|o| collect_references(o, out)),
        Object::Dictionary(d) => d.iter().for_each(|(_, o)| collect_references(o, out)),
        Object::Stream(s) => s.dict.iter().for_each(|(_, o)| collect_references(o, out)),
        _ => {}
    }
}

fn locate_header(bytes: &[u8]) -> Result<(usize, String)> {
    let window = &bytes[..bytes.len().min(HEADER_WINDOW)];
    let pos = memchr::memmem::find(window, b"%PDF-")
        .ok_or_else(|| AttachError::MalformedDocument("missing %PDF- header".into()))?;
    let digits: String = bytes[pos + 5..]
        .iter()
        .take_while(|b| b.is_ascii_digit() || **b == b'.')
        .map(|b| char::from(*b))
        .collect();
    if digits.is_empty() {
        return Err(malformed(pos, "header without version number"));
    }
    if pos > 0 {
        warn!(
            domain = "pdf.document",
            kind = "header_offset",
            offset = pos,
            "Junk before %PDF- header"
        );
    }
    Ok((pos, digits))
}

fn read_table(bytes: &[u8], header_pos: usize) -> Result<XrefTable> {
    let startxref = find_startxref(bytes)?;
    match read_xref_chain(bytes, startxref) {
        Err(AttachError::MalformedDocument(_)) if header_pos > 0 => {
            read_xref_chain(bytes, startxref + header_pos)
        }
        other => other,
    }
}

fn load_object(
    bytes: &[u8],
    offset: usize,
    num: u32,
    lengths: &dyn Fn(ObjectId) -> Option<usize>,
) -> Option<(ObjectId, Object)> {
    if offset >= bytes.len() {
        return None;
    }
    match parse_indirect_object_at(bytes, offset, Some(lengths)) {
        Ok((id, object, _)) if id.0 == num => Some((id, object)),
        _ => None,
    }
}
