#![deny(missing_docs)]

//! This crate rewrites the tar archive of a single container image layer so that files with
//! identical content are stored once and every later copy becomes a hard link to the first one.
//!
//! The rewrite is a single streaming pass. [`filter::dedup_archive`] runs it synchronously from
//! any [`std::io::Read`] into any [`std::io::Write`]. The [`tokio`] module runs the same pass on
//! the blocking pool and hands the output to an async consumer through a bounded pipe while it is
//! still being produced.
//!
//! ```
//! use layer_dedup::{filter::dedup_archive, DedupOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = tar::Builder::new(Vec::new());
//! for path in ["usr/lib/a.so", "usr/lib/b.so"] {
//!     let mut header = tar::Header::new_gnu();
//!     header.set_size(20_000);
//!     header.set_mode(0o644);
//!     header.set_cksum();
//!     builder.append_data(&mut header, path, &[7u8; 20_000][..])?;
//! }
//! let layer = builder.into_inner()?;
//!
//! let mut rewritten = Vec::new();
//! let stats = dedup_archive(layer.as_slice(), &mut rewritten, &DedupOptions::default())?;
//! assert_eq!(stats.links, 1);
//! assert_eq!(stats.bytes_saved, 20_000);
//! # Ok(())
//! # }
//! ```

use std::fmt::{Display, Formatter};

mod extensions;
pub mod filter;
pub mod index;
mod io;
mod options;
mod rewrite;
pub mod source;
pub mod tokio;

pub use layer_digest::DigestAlgorithm;
pub use options::{DedupOptions, DEFAULT_THRESHOLD};
pub use source::{LayerAction, LayerCompression, LayerSource, MediaType};

/// An error that terminates a deduplication pass.
#[derive(thiserror::Error, Debug)]
pub enum DedupError {
    /// A header of the source archive could not be decoded.
    #[error("malformed layer archive")]
    MalformedArchive(#[source] std::io::Error),

    /// The source stream failed or ended before the end-of-archive marker.
    #[error("failed to read the layer archive")]
    SourceReadFailure(#[source] std::io::Error),

    /// The rewritten archive could not be handed to its consumer.
    #[error("failed to write the rewritten layer")]
    SinkWriteFailure(#[source] std::io::Error),

    /// The layer content provider could not supply the layer.
    #[error("could not obtain the layer content")]
    UpstreamResolutionFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The entry is valid but cannot be re-emitted faithfully by a streaming rewrite.
    #[error("unsupported entry '{path}': {reason}")]
    UnsupportedEntry {
        /// The path of the offending entry.
        path: String,
        /// Why the entry cannot be handled.
        reason: &'static str,
    },

    /// The temporary buffer for a candidate file failed.
    #[error("failed to buffer file content")]
    SpoolFailure(#[source] std::io::Error),

    /// The pass was cancelled before it completed.
    #[error("the layer rewrite was cancelled")]
    Cancelled,
}

impl DedupError {
    /// Wraps an error of a layer content provider.
    pub fn upstream(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        DedupError::UpstreamResolutionFailure(err.into())
    }

    /// Returns what kind of failure this is.
    pub fn kind(&self) -> FailureKind {
        match self {
            DedupError::MalformedArchive(_) => FailureKind::MalformedArchive,
            DedupError::SourceReadFailure(_) => FailureKind::SourceRead,
            DedupError::SinkWriteFailure(_) => FailureKind::SinkWrite,
            DedupError::UpstreamResolutionFailure(_) => FailureKind::UpstreamResolution,
            DedupError::UnsupportedEntry { .. } => FailureKind::UnsupportedEntry,
            DedupError::SpoolFailure(_) => FailureKind::Spool,
            DedupError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Converts the error into the terminal condition delivered on the read side of a
    /// [`tokio::LayerStream`].
    pub(crate) fn to_stream_error(&self) -> std::io::Error {
        let stream_error = StreamError::from(self);
        std::io::Error::new(stream_error.kind.io_error_kind(), stream_error)
    }
}

/// The discriminant of a [`DedupError`], also carried by a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// See [`DedupError::MalformedArchive`].
    MalformedArchive,
    /// See [`DedupError::SourceReadFailure`].
    SourceRead,
    /// See [`DedupError::SinkWriteFailure`].
    SinkWrite,
    /// See [`DedupError::UpstreamResolutionFailure`].
    UpstreamResolution,
    /// See [`DedupError::UnsupportedEntry`].
    UnsupportedEntry,
    /// See [`DedupError::SpoolFailure`].
    Spool,
    /// See [`DedupError::Cancelled`].
    Cancelled,
    /// The producer stopped without reporting an outcome, for instance because it panicked.
    Aborted,
}

impl FailureKind {
    fn io_error_kind(self) -> std::io::ErrorKind {
        match self {
            FailureKind::MalformedArchive | FailureKind::UnsupportedEntry => {
                std::io::ErrorKind::InvalidData
            }
            FailureKind::SourceRead => std::io::ErrorKind::UnexpectedEof,
            FailureKind::SinkWrite => std::io::ErrorKind::BrokenPipe,
            FailureKind::UpstreamResolution
            | FailureKind::Spool
            | FailureKind::Cancelled
            | FailureKind::Aborted => std::io::ErrorKind::Other,
        }
    }
}

/// The payload of the [`std::io::Error`] that terminates the read side of a
/// [`tokio::LayerStream`] when its pass failed.
///
/// A consumer that sees a plain end of stream knows the pass succeeded. A consumer that sees an
/// error can use [`StreamError::from_io_error`] to find out why the output must be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    kind: FailureKind,
    message: String,
}

impl StreamError {
    pub(crate) fn aborted() -> Self {
        Self {
            kind: FailureKind::Aborted,
            message: String::from("the layer rewrite stopped without reporting a result"),
        }
    }

    /// The kind of failure that ended the pass.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// A human readable description including the causes of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the [`StreamError`] carried by an error read from a [`tokio::LayerStream`], if any.
    pub fn from_io_error(err: &std::io::Error) -> Option<&StreamError> {
        err.get_ref()?.downcast_ref::<StreamError>()
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StreamError {}

impl From<&DedupError> for StreamError {
    fn from(err: &DedupError) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind: err.kind(),
            message,
        }
    }
}

/// Counters describing a completed deduplication pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DedupStats {
    /// The number of entries in the archive. Extension records are part of the entry they
    /// describe and are not counted separately.
    pub entries: u64,

    /// The number of regular files that were large enough to be considered for linking.
    pub candidates: u64,

    /// The number of entries that were rewritten as hard links.
    pub links: u64,

    /// The number of distinct contents among the candidates.
    pub unique_contents: u64,

    /// The sum of the original sizes of all entries that were rewritten as hard links.
    pub bytes_saved: u64,
}
