use std::path::Path;

use tracing::info;

use crate::document::Document;
use crate::embed::{Attachment, Embedder};
use crate::embedded::{read_embedded_files, EmbeddedFile};
use crate::object::ObjectId;
use crate::writer::Writer;
use crate::{AttachConfig, Result};

// ── PdfAttacher ───────────────────────────────────────────────────────────────

/// Entry point for loading a PDF, attaching files and writing it back.
///
/// # Creating an attacher
///
/// ```no_run
/// use attachpdf::{AttachConfig, NameTreePolicy, PdfAttacher};
///
/// // From a file path
/// let a = PdfAttacher::from_path("invoice.pdf").unwrap();
///
/// // From an in-memory buffer
/// let bytes = std::fs::read("invoice.pdf").unwrap();
/// let a = PdfAttacher::from_bytes(&bytes).unwrap();
///
/// // With custom configuration
/// let cfg = AttachConfig {
///     name_tree_policy: NameTreePolicy::Merge,
///     max_attachment_size: Some(10 * 1024 * 1024),
///     ..Default::default()
/// };
/// let a = PdfAttacher::with_config("invoice.pdf", cfg).unwrap();
/// ```
pub struct PdfAttacher {
    document: Document,
    config: AttachConfig,
}

impl PdfAttacher {
    // ── Constructors ──────────────────────────────────────────────────────────

    /// Load a PDF from the file system.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(path, AttachConfig::default())
    }

    /// Load a PDF from an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let config = AttachConfig::default();
        Ok(Self {
            document: Document::load_mem(data, &config)?,
            config,
        })
    }

    /// Load a PDF from the file system with a custom [`AttachConfig`].
    pub fn with_config<P: AsRef<Path>>(path: P, config: AttachConfig) -> Result<Self> {
        Ok(Self {
            document: Document::load(path, &config)?,
            config,
        })
    }

    // ── Attaching ─────────────────────────────────────────────────────────────

    /// Embed `attachment` and return the id of its file specification.
    pub fn attach(&mut self, attachment: &Attachment) -> Result<ObjectId> {
        let spec = Embedder::new(&self.config).embed(&mut self.document, attachment)?;
        info!(
            domain = "pdf.attach",
            name = %attachment.name,
            bytes = attachment.data.len(),
            "Attached file"
        );
        Ok(spec)
    }

    /// Read the file at `path` and embed it under its final path component.
    pub fn attach_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ObjectId> {
        let attachment = Attachment::from_path(path)?;
        self.attach(&attachment)
    }

    // ── Embedded file discovery ───────────────────────────────────────────────

    /// Every file in the document's `/EmbeddedFiles` name tree, decoded.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use attachpdf::PdfAttacher;
    ///
    /// let attacher = PdfAttacher::from_path("invoice.pdf").unwrap();
    /// for file in attacher.embedded_files().unwrap() {
    ///     println!("{}: {} bytes", file.filename, file.data.len());
    ///     file.save_to_disk("./out").unwrap();
    /// }
    /// ```
    pub fn embedded_files(&self) -> Result<Vec<EmbeddedFile>> {
        read_embedded_files(&self.document)
    }

    /// Returns the number of embedded files in the document.
    pub fn count_embedded_files(&self) -> Result<usize> {
        Ok(self.embedded_files()?.len())
    }

    /// Returns `Ok(true)` when the document contains at least one embedded file.
    pub fn has_embedded_files(&self) -> Result<bool> {
        Ok(self.count_embedded_files()? > 0)
    }

    // ── Output ────────────────────────────────────────────────────────────────

    /// Serialize the document according to the configured [`crate::WriteMode`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Writer::new(&self.config).write(&self.document)
    }

    /// Write the document to `path` atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Writer::new(&self.config).save(&self.document, path)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }
}
