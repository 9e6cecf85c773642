use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;

use crate::document::Document;
use crate::name_tree;
use crate::object::{Dictionary, Object, ObjectId, Stream};
use crate::pdf_utils::{decode_text_string, hex_encode, string_from_dict};
use crate::{AttachError, Result};

// ── EmbeddedFile ─────────────────────────────────────────────────────────────

/// A file found in a document's `/EmbeddedFiles` name tree.
///
/// Returned by [`crate::PdfAttacher::embedded_files`].
#[derive(Debug, Clone)]
pub struct EmbeddedFile {
    /// The name-tree key.
    pub key: String,

    /// The filename as declared in the file specification
    /// (`/UF` preferred over `/F`, falling back to the key).
    pub filename: String,

    /// The decoded file content.
    pub data: Vec<u8>,

    /// Metadata from the file specification and the stream's `/Params`.
    pub metadata: EmbeddedFileMetadata,
}

impl EmbeddedFile {
    /// Write this file into `output_dir`, creating the directory if necessary.
    ///
    /// Only the final component of [`filename`](Self::filename) is used, so
    /// a hostile name cannot escape `output_dir`.
    pub fn save_to_disk<P: AsRef<Path>>(&self, output_dir: P) -> std::io::Result<()> {
        let dir = output_dir.as_ref();
        let name = Path::new(&self.filename)
            .file_name()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty file name")
            })?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(name), &self.data)
    }

    /// Returns the file extension, or `None` if the filename has none.
    ///
    /// ```
    /// # use attachpdf::EmbeddedFile;
    /// # let file = EmbeddedFile { key: "x".into(), filename: "factur-x.xml".into(), data: vec![], metadata: Default::default() };
    /// assert_eq!(file.extension(), Some("xml"));
    /// ```
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.filename).extension().and_then(|e| e.to_str())
    }

    /// Returns `true` when the file's extension matches `ext`
    /// (case-insensitive comparison).
    pub fn has_extension(&self, ext: &str) -> bool {
        self.extension()
            .map(|e| e.eq_ignore_ascii_case(ext))
            .unwrap_or(false)
    }
}

// ── EmbeddedFileMetadata ──────────────────────────────────────────────────────

/// Metadata associated with an [`EmbeddedFile`].
///
/// All fields are optional: a conforming PDF need not populate them.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedFileMetadata {
    /// MIME type from the stream's `/Subtype` (e.g. `"application/xml"`).
    pub mime_type: Option<String>,

    /// Human-readable description from the `/Desc` entry.
    pub description: Option<String>,

    /// `/Params/CreationDate` in PDF date format.
    pub creation_date: Option<String>,

    /// `/Params/ModDate` in PDF date format.
    pub modification_date: Option<String>,

    /// Uncompressed size in bytes, from `/Params/Size`.
    pub size: Option<usize>,

    /// MD5 checksum hex string from `/Params/CheckSum`.
    pub checksum: Option<String>,
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Read every entry of the catalog's `/Names/EmbeddedFiles` tree.
pub(crate) fn read_embedded_files(doc: &Document) -> Result<Vec<EmbeddedFile>> {
    let Some(names) = doc.catalog()?.get(b"Names") else {
        return Ok(Vec::new());
    };
    let Some(names) = doc.resolve(names)?.as_dict() else {
        return Ok(Vec::new());
    };
    let Some(tree) = names.get(b"EmbeddedFiles") else {
        return Ok(Vec::new());
    };

    name_tree::collect_entries(doc, tree)?
        .into_iter()
        .map(|(key, spec)| {
            let key = decode_text_string(&key);
            read_file_spec(doc, key, &spec)
        })
        .collect()
}

fn read_file_spec(doc: &Document, key: String, spec: &Object) -> Result<EmbeddedFile> {
    let spec = doc.resolve(spec)?.as_dict().ok_or_else(|| {
        AttachError::MalformedDocument(format!(
            "file specification for '{key}' is not a dictionary"
        ))
    })?;
    let ef = doc
        .resolve(spec.get(b"EF").ok_or_else(|| {
            AttachError::MalformedDocument(format!("file specification for '{key}' has no /EF"))
        })?)?
        .as_dict()
        .ok_or_else(|| {
            AttachError::MalformedDocument(format!("/EF of '{key}' is not a dictionary"))
        })?;

    let stream_id: ObjectId = ef
        .get(b"UF")
        .or_else(|| ef.get(b"F"))
        .and_then(Object::as_reference)
        .ok_or_else(|| {
            AttachError::MalformedDocument(format!("/EF of '{key}' has no stream reference"))
        })?;
    let stream = doc.get_object(stream_id)?.as_stream().ok_or_else(|| {
        AttachError::MalformedDocument(format!("embedded file '{key}' is not a stream"))
    })?;

    let data = decode_stream(stream)?;
    let filename = string_from_dict(spec, b"UF")
        .or_else(|| string_from_dict(spec, b"F"))
        .unwrap_or_else(|| key.clone());
    let metadata = read_metadata(spec, &stream.dict);
    Ok(EmbeddedFile { key, filename, data, metadata })
}

/// Undo the stream's filters. Only `/FlateDecode` is understood.
pub(crate) fn decode_stream(stream: &Stream) -> Result<Vec<u8>> {
    let mut data = stream.content.clone();
    for filter in stream.filters() {
        match filter {
            b"FlateDecode" | b"Fl" => {
                let mut out = Vec::new();
                ZlibDecoder::new(data.as_slice()).read_to_end(&mut out)?;
                data = out;
            }
            other => {
                return Err(AttachError::Unsupported(format!(
                    "stream filter /{}",
                    String::from_utf8_lossy(other)
                )))
            }
        }
    }
    Ok(data)
}

fn read_metadata(spec: &Dictionary, stream_dict: &Dictionary) -> EmbeddedFileMetadata {
    let mut m = EmbeddedFileMetadata {
        description: string_from_dict(spec, b"Desc"),
        mime_type: stream_dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .map(|n| String::from_utf8_lossy(n).to_ascii_lowercase()),
        ..Default::default()
    };

    if let Some(params) = stream_dict.get(b"Params").and_then(Object::as_dict) {
        m.creation_date = string_from_dict(params, b"CreationDate");
        m.modification_date = string_from_dict(params, b"ModDate");
        m.size = params
            .get(b"Size")
            .and_then(Object::as_i64)
            .and_then(|n| usize::try_from(n).ok());
        m.checksum = params.get(b"CheckSum").and_then(Object::as_str).map(hex_encode);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_to_disk_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = EmbeddedFile {
            key: "k".into(),
            filename: "../../etc/evil.txt".into(),
            data: b"hello world".to_vec(),
            metadata: EmbeddedFileMetadata::default(),
        };
        file.save_to_disk(dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("evil.txt")).unwrap(), b"hello world");
    }

    #[test]
    fn unknown_filter_is_unsupported() {
        let dict = Dictionary::from_iter([("Filter", Object::name("LZWDecode"))]);
        let err = decode_stream(&Stream::new(dict, vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, AttachError::Unsupported(_)));
    }

    #[test]
    fn has_extension_ignores_case() {
        let file = EmbeddedFile {
            key: "k".into(),
            filename: "Factur-X.XML".into(),
            data: vec![],
            metadata: Default::default(),
        };
        assert!(file.has_extension("xml"));
    }
}
