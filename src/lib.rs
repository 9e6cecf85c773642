//! # attachpdf
//!
//! A Rust library for embedding files into existing PDF documents.
//!
//! ## What this crate does
//!
//! 1. **Parse**: reads the PDF header, cross-reference tables and trailer and
//!    loads every indirect object into an in-memory arena ([`Document`]).
//! 2. **Embed**: allocates an embedded-file stream and a file specification
//!    and links them into the catalog's `/Names/EmbeddedFiles` name tree.
//! 3. **Write**: serializes the object graph again with a freshly computed
//!    cross-reference table (or as an incremental update) and places the
//!    result atomically at the destination path.
//!
//! No third-party PDF library is involved; the object model, parser and
//! writer live in this crate.
//!
//! ## Quick example
//!
//! ```no_run
//! use attachpdf::PdfAttacher;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut attacher = PdfAttacher::from_path("invoice.pdf")?;
//! attacher.attach_file("factur-x.xml")?;
//! attacher.save("invoice-with-xml.pdf")?;
//!
//! for file in attacher.embedded_files()? {
//!     println!("  {}: {} bytes", file.filename, file.data.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use thiserror::Error;

mod attacher;
mod document;
mod embed;
mod embedded;
mod lexer;
mod name_tree;
mod object;
mod parser;
mod pdf_utils;
mod writer;
mod xref;

pub use attacher::PdfAttacher;
pub use document::Document;
pub use embed::{embed, Attachment, Embedder};
pub use embedded::{EmbeddedFile, EmbeddedFileMetadata};
pub use object::{Dictionary, Object, ObjectId, Stream, StringFormat, MAX_OBJECT_NUMBER};
pub use pdf_utils::{decode_text_string, encode_text_string, pdf_date};
pub use writer::Writer;

// ── Configuration ────────────────────────────────────────────────────────────

/// What happens to an existing `/EmbeddedFiles` name tree when a new
/// attachment is embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameTreePolicy {
    /// Start a fresh tree holding only the new attachment. Earlier
    /// attachments become unreachable; other `/Names` entries are kept.
    #[default]
    Replace,

    /// Keep every existing entry and insert the new one. An entry with the
    /// same name is overwritten.
    Merge,
}

/// How [`Writer`] lays out the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Re-emit every object with a new cross-reference table.
    #[default]
    FullRewrite,

    /// Keep the original bytes and append the changed objects, a new
    /// cross-reference section and a trailer with `/Prev`.
    Incremental,
}

/// Runtime configuration shared by the parser, [`Embedder`] and [`Writer`].
#[derive(Debug, Clone, Default)]
pub struct AttachConfig {
    /// If set, embedding returns [`AttachError::AttachmentTooLarge`] when the
    /// attachment exceeds this byte count.
    pub max_attachment_size: Option<usize>,

    /// When `true`, attachment streams are stored with `/FlateDecode`.
    pub compress: bool,

    /// Merge into or replace an existing `/EmbeddedFiles` tree.
    pub name_tree_policy: NameTreePolicy,

    /// Full rewrite or incremental update.
    pub write_mode: WriteMode,

    /// When `true`, a full rewrite also emits objects that are no longer
    /// reachable from the trailer.
    pub keep_unreachable: bool,

    /// When `true`, a broken cross-reference table is a hard error instead of
    /// triggering a reconstruction scan.
    pub strict_xref: bool,
}

// ── Error type ───────────────────────────────────────────────────────────────

/// Every error that this crate can produce.
#[derive(Error, Debug)]
pub enum AttachError {
    /// The command line did not have the expected shape.
    #[error("usage: {0}")]
    Usage(String),

    /// A filesystem I/O error occurred while reading the input or attachment.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The input bytes do not form a structurally valid PDF document.
    #[error("malformed PDF: {0}")]
    MalformedDocument(String),

    /// The input uses a PDF feature this crate does not handle.
    #[error("unsupported PDF feature: {0}")]
    Unsupported(String),

    /// A reference points at an object that is not in the document.
    #[error("broken reference: object {0:?} is not in the document")]
    BrokenReference(ObjectId),

    /// The attachment exceeds the configured `max_attachment_size` limit.
    #[error("attachment is {size} bytes, limit is {limit} bytes")]
    AttachmentTooLarge { size: usize, limit: usize },

    /// Writing the output file failed.
    #[error("failed to write '{}': {source}", .path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AttachError>;
