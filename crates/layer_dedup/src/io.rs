//! Readers that remember where an I/O error came from.
//!
//! Inside a pass the same call can fail because of the source, the spool or the sink (for
//! instance [`tar::Builder::append`] reads from one and writes to the other). Errors of the
//! readers below are tagged with their [`Origin`] so they can be mapped to the right
//! [`DedupError`] afterwards.

use crate::DedupError;
use std::fmt::{Display, Formatter};
use std::io::{Error, ErrorKind, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Source,
    Spool,
}

#[derive(Debug)]
struct TaggedError {
    origin: Origin,
    error: Error,
}

impl Display for TaggedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for TaggedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

fn tag(origin: Origin, error: Error) -> Error {
    Error::new(error.kind(), TaggedError { origin, error })
}

/// Tags every error of the wrapped reader with an [`Origin`].
///
/// It also remembers whether the wrapped reader ever reported the end of its data. The `tar`
/// crate treats an input that stops on a block boundary like one that ends with the
/// end-of-archive marker, this flag tells the two apart.
pub(crate) struct Tagged<R> {
    inner: R,
    origin: Origin,
    reached_eof: bool,
}

impl<R> Tagged<R> {
    pub fn source(inner: R) -> Self {
        Self {
            inner,
            origin: Origin::Source,
            reached_eof: false,
        }
    }

    pub fn spool(inner: R) -> Self {
        Self {
            inner,
            origin: Origin::Spool,
            reached_eof: false,
        }
    }

    /// Returns true if a read returned no data although there was room for it.
    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }
}

impl<R: Read> Read for Tagged<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf).map_err(|err| tag(self.origin, err))?;
        if read == 0 && !buf.is_empty() {
            self.reached_eof = true;
        }
        Ok(read)
    }
}

/// Reads exactly `remaining` bytes from the wrapped reader. Running out early is reported as a
/// truncated source instead of silently producing a short entry.
pub(crate) struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(buf.len());
        let read = self.inner.read(&mut buf[..max])?;
        if read == 0 {
            return Err(tag(
                Origin::Source,
                Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "the archive ended {} bytes before the end of the entry",
                        self.remaining
                    ),
                ),
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// Maps an error to a [`DedupError`] based on its origin tag. Untagged errors are handed to
/// `untagged`.
pub(crate) fn classify(err: Error, untagged: impl FnOnce(Error) -> DedupError) -> DedupError {
    let is_tagged = err
        .get_ref()
        .is_some_and(|inner| inner.is::<TaggedError>());
    if !is_tagged {
        return untagged(err);
    }

    let tagged = err
        .into_inner()
        .and_then(|inner| inner.downcast::<TaggedError>().ok())
        .map(|tagged| *tagged);
    match tagged {
        Some(TaggedError {
            origin: Origin::Source,
            error,
        }) => DedupError::SourceReadFailure(error),
        Some(TaggedError {
            origin: Origin::Spool,
            error,
        }) => DedupError::SpoolFailure(error),
        None => untagged(Error::new(ErrorKind::Other, "lost the origin of an I/O error")),
    }
}

/// Maps an error raised while decoding archive headers.
///
/// The `tar` crate reports undecodable headers as plain errors, premature end of input shows up
/// as [`ErrorKind::UnexpectedEof`].
pub(crate) fn classify_header_error(err: Error) -> DedupError {
    classify(err, |err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            DedupError::SourceReadFailure(err)
        } else {
            DedupError::MalformedArchive(err)
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(Error::new(ErrorKind::ConnectionReset, "connection reset"))
        }
    }

    #[test]
    fn test_source_errors_are_tagged() {
        let mut reader = Tagged::source(FailingReader);
        let err = reader.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_matches!(
            classify(err, DedupError::SinkWriteFailure),
            DedupError::SourceReadFailure(inner) if inner.kind() == ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_spool_errors_are_tagged() {
        let mut reader = Tagged::spool(FailingReader);
        let err = reader.read(&mut [0u8; 16]).unwrap_err();
        assert_matches!(
            classify(err, DedupError::SinkWriteFailure),
            DedupError::SpoolFailure(_)
        );
    }

    #[test]
    fn test_untagged_errors_use_fallback() {
        let err = Error::new(ErrorKind::BrokenPipe, "pipe closed");
        assert_matches!(
            classify(err, DedupError::SinkWriteFailure),
            DedupError::SinkWriteFailure(_)
        );
    }

    #[test]
    fn test_tagged_tracks_eof() {
        let mut reader = Tagged::source(&b"abc"[..]);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert!(!reader.reached_eof());
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(reader.reached_eof());
    }

    #[test]
    fn test_exact_reader_reports_truncation() {
        let mut reader = ExactReader::new(&b"short"[..], 10);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(out, b"short");
        assert_matches!(
            classify(err, DedupError::SinkWriteFailure),
            DedupError::SourceReadFailure(inner) if inner.kind() == ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_exact_reader_stops_at_length() {
        let mut reader = ExactReader::new(&b"0123456789"[..], 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123");
    }

    #[test]
    fn test_header_errors() {
        assert_matches!(
            classify_header_error(Error::new(ErrorKind::Other, "checksum mismatch")),
            DedupError::MalformedArchive(_)
        );
        assert_matches!(
            classify_header_error(Error::new(ErrorKind::UnexpectedEof, "eof")),
            DedupError::SourceReadFailure(_)
        );
    }
}
