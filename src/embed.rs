use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::document::Document;
use crate::name_tree;
use crate::object::{Dictionary, Object, ObjectId, Stream, StringFormat};
use crate::pdf_utils::{encode_text_string, mime_type_for, pdf_date};
use crate::{AttachConfig, AttachError, NameTreePolicy, Result};

// ── Attachment ───────────────────────────────────────────────────────────────

/// A file to be embedded, with the metadata written next to it.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Key in the `/EmbeddedFiles` tree and the file specification's name.
    pub name: String,

    /// Raw file content, stored uncompressed unless
    /// [`AttachConfig::compress`] is set.
    pub data: Vec<u8>,

    /// Written as `/Params/CreationDate`.
    pub created: OffsetDateTime,

    /// Written as `/Params/ModDate` when known.
    pub modified: Option<OffsetDateTime>,

    /// MIME type written as the stream's `/Subtype`.
    pub mime_type: Option<String>,

    /// Written as the file specification's `/Desc`.
    pub description: Option<String>,
}

impl Attachment {
    pub fn new<S: Into<String>>(name: S, data: Vec<u8>, created: OffsetDateTime) -> Self {
        Self {
            name: name.into(),
            data,
            created,
            modified: None,
            mime_type: None,
            description: None,
        }
    }

    /// Read the file at `path` in one go.
    ///
    /// The attachment is named after the final path component; the MIME
    /// type is guessed from the extension and `/ModDate` comes from the
    /// file's modification time.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AttachError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{}' does not name a file", path.display()),
                ))
            })?;
        let data = std::fs::read(path)?;
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(OffsetDateTime::from);

        Ok(Self {
            name,
            data,
            created: OffsetDateTime::now_utc(),
            modified,
            mime_type: mime_type_for(path).map(str::to_owned),
            description: None,
        })
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_modified(mut self, modified: OffsetDateTime) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// Embed `data` under `name` using the default [`AttachConfig`].
///
/// ```no_run
/// use attachpdf::{embed, AttachConfig, Document};
/// use time::OffsetDateTime;
///
/// let mut doc = Document::load("in.pdf", &AttachConfig::default()).unwrap();
/// embed(&mut doc, "notes.txt", b"hello", OffsetDateTime::now_utc()).unwrap();
/// ```
pub fn embed(
    document: &mut Document,
    name: &str,
    data: &[u8],
    created: OffsetDateTime,
) -> Result<()> {
    let attachment = Attachment::new(name, data.to_vec(), created);
    Embedder::new(&AttachConfig::default()).embed(document, &attachment)?;
    Ok(())
}

// ── Embedder ──────────────────────────────────────────────────────────────────

/// Where the catalog keeps its `/Names` dictionary.
enum NamesSlot {
    Indirect(ObjectId),
    Inline,
    Missing,
}

/// Links attachments into a document's `/Names/EmbeddedFiles` tree.
pub struct Embedder<'a> {
    config: &'a AttachConfig,
}

impl<'a> Embedder<'a> {
    pub fn new(config: &'a AttachConfig) -> Self {
        Self { config }
    }

    /// Embed `attachment` and return the id of its file specification.
    ///
    /// Every fallible step runs before the document is touched, so an error
    /// leaves `document` unchanged.
    pub fn embed(&self, document: &mut Document, attachment: &Attachment) -> Result<ObjectId> {
        if let Some(limit) = self.config.max_attachment_size {
            if attachment.data.len() > limit {
                return Err(AttachError::AttachmentTooLarge { size: attachment.data.len(), limit });
            }
        }

        let slot = names_slot(document)?;
        let mut entries = self.existing_entries(document, &slot)?;
        let stream = self.embedded_file_stream(attachment)?;

        let key = encode_text_string(&attachment.name);
        let tree_size = entries.len() + usize::from(!entries.contains_key(&key));
        let names_object = usize::from(matches!(slot, NamesSlot::Missing));
        document.ensure_capacity(2 + name_tree::node_count(tree_size) + names_object)?;

        let stream_id = document.add_object(stream)?;
        let spec_id = document.add_object(file_specification(attachment, stream_id))?;

        if entries.insert(key, Object::Reference(spec_id)).is_some() {
            debug!(
                domain = "pdf.embed",
                name = %attachment.name,
                "Overwriting attachment with the same name"
            );
        }
        let tree_id = name_tree::build(document, entries)?;

        match slot {
            NamesSlot::Indirect(id) => {
                document.get_dict_mut(id)?.set("EmbeddedFiles", Object::Reference(tree_id));
            }
            NamesSlot::Inline => {
                let names = document
                    .catalog_mut()?
                    .get_mut(b"Names")
                    .and_then(Object::as_dict_mut)
                    .ok_or_else(|| {
                        AttachError::MalformedDocument("catalog /Names vanished".into())
                    })?;
                names.set("EmbeddedFiles", Object::Reference(tree_id));
            }
            NamesSlot::Missing => {
                let names = Dictionary::from_iter([("EmbeddedFiles", Object::Reference(tree_id))]);
                let names_id = document.add_object(names)?;
                document.catalog_mut()?.set("Names", Object::Reference(names_id));
            }
        }

        debug!(
            domain = "pdf.embed",
            name = %attachment.name,
            size = attachment.data.len(),
            filespec = spec_id.0,
            stream = stream_id.0,
            "Embedded attachment"
        );
        Ok(spec_id)
    }

    fn existing_entries(
        &self,
        document: &Document,
        slot: &NamesSlot,
    ) -> Result<BTreeMap<Vec<u8>, Object>> {
        let names = match slot {
            NamesSlot::Indirect(id) => document.get_dict(*id)?,
            NamesSlot::Inline => match document.catalog()?.get(b"Names") {
                Some(Object::Dictionary(d)) => d,
                _ => return Ok(BTreeMap::new()),
            },
            NamesSlot::Missing => return Ok(BTreeMap::new()),
        };
        let Some(tree) = names.get(b"EmbeddedFiles") else {
            return Ok(BTreeMap::new());
        };

        match self.config.name_tree_policy {
            NameTreePolicy::Merge => name_tree::collect_entries(document, tree),
            NameTreePolicy::Replace => {
                debug!(domain = "pdf.embed", "Replacing existing /EmbeddedFiles tree");
                Ok(BTreeMap::new())
            }
        }
    }

    fn embedded_file_stream(&self, attachment: &Attachment) -> Result<Stream> {
        let mut params = Dictionary::new();
        params.set("Size", Object::Integer(attachment.data.len() as i64));
        params.set("CreationDate", Object::string_literal(pdf_date(attachment.created)));
        if let Some(modified) = attachment.modified {
            params.set("ModDate", Object::string_literal(pdf_date(modified)));
        }
        params.set(
            "CheckSum",
            Object::String(md5::compute(&attachment.data).0.to_vec(), StringFormat::Hexadecimal),
        );

        let mut dict = Dictionary::new();
        dict.set("Type", Object::name("EmbeddedFile"));
        if let Some(mime) = &attachment.mime_type {
            dict.set("Subtype", Object::name(mime.as_str()));
        }
        dict.set("Params", params);

        let content = if self.config.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&attachment.data)?;
            dict.set("Filter", Object::name("FlateDecode"));
            encoder.finish()?
        } else {
            attachment.data.clone()
        };
        dict.set("Length", Object::Integer(content.len() as i64));
        Ok(Stream::new(dict, content))
    }
}

fn names_slot(document: &Document) -> Result<NamesSlot> {
    let slot = match document.catalog()?.get(b"Names") {
        None => NamesSlot::Missing,
        Some(Object::Dictionary(_)) => NamesSlot::Inline,
        Some(Object::Reference(id)) if document.get_dict(*id).is_ok() => NamesSlot::Indirect(*id),
        Some(other) => {
            warn!(
                domain = "pdf.embed",
                kind = "names_unusable",
                found = %other,
                "Catalog /Names is unusable, creating a new one"
            );
            NamesSlot::Missing
        }
    };
    Ok(slot)
}

fn file_specification(attachment: &Attachment, stream_id: ObjectId) -> Dictionary {
    // /F predates Unicode file names; keep it ASCII and put the real name in /UF.
    let ascii_name: String = attachment
        .name
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect();

    let mut spec = Dictionary::new();
    spec.set("Type", Object::name("Filespec"));
    spec.set("F", Object::string_literal(ascii_name));
    spec.set("UF", Object::string_literal(encode_text_string(&attachment.name)));
    spec.set(
        "EF",
        Dictionary::from_iter([
            ("F", Object::Reference(stream_id)),
            ("UF", Object::Reference(stream_id)),
        ]),
    );
    if let Some(desc) = &attachment.description {
        spec.set("Desc", Object::string_literal(encode_text_string(desc)));
    }
    spec
}
