//! The single pass over a layer archive that decides, entry by entry, whether a file is written
//! out or replaced by a hard link.

use crate::extensions::{PendingExtensions, MAX_EXTENSION_SIZE};
use crate::index::{DedupIndex, Recorded};
use crate::io::{classify, classify_header_error, ExactReader, Tagged};
use crate::rewrite::ArchiveRewriter;
use crate::{DedupError, DedupOptions, DedupStats};
use digest::Digest;
use layer_digest::{Blake2b256, DigestAlgorithm, HashingWriter, Md5, Sha256};
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use tar::{EntryType, Header};
use tempfile::SpooledTempFile;
use tokio_util::sync::CancellationToken;

/// Copies the tar archive in `reader` to `writer`, replacing every regular file whose content
/// was already written earlier in the archive with a hard link to that earlier file.
///
/// Only files larger than [`DedupOptions::threshold`] are considered. Everything else is written
/// with its original header and extension records and its original content. The padding after
/// the content of an entry is always written as zeros, whatever the source held there.
///
/// On success the end-of-archive marker has been written and `writer` has been flushed. On error
/// `writer` may have received part of the archive but never the end-of-archive marker, so the
/// partial output cannot be mistaken for a complete archive.
///
/// # Errors
///
/// Besides read, write and decoding failures, the pass fails with
/// [`DedupError::UnsupportedEntry`] for entries whose data cannot be copied without decoding it:
///
/// - entries whose size is given by a PAX `size` record, which tar writers use for files of 8 GiB
///   and more,
/// - old GNU sparse files whose sparse map continues in extension blocks.
pub fn dedup_archive<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    options: &DedupOptions,
) -> Result<DedupStats, DedupError> {
    dedup_archive_with_cancellation(reader, writer, options, &CancellationToken::new())
}

/// Like [`dedup_archive`] but stops with [`DedupError::Cancelled`] once `cancellation_token` is
/// cancelled. The token is checked before every entry.
pub fn dedup_archive_with_cancellation<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    options: &DedupOptions,
    cancellation_token: &CancellationToken,
) -> Result<DedupStats, DedupError> {
    match options.digest {
        DigestAlgorithm::Md5 => {
            DecisionLoop::<Md5>::new(options, cancellation_token).run(reader, writer)
        }
        DigestAlgorithm::Sha256 => {
            DecisionLoop::<Sha256>::new(options, cancellation_token).run(reader, writer)
        }
        DigestAlgorithm::Blake2b256 => {
            DecisionLoop::<Blake2b256>::new(options, cancellation_token).run(reader, writer)
        }
    }
}

struct DecisionLoop<'a, D: Digest> {
    options: &'a DedupOptions,
    cancellation_token: &'a CancellationToken,
    index: DedupIndex<D>,
    stats: DedupStats,
}

impl<'a, D: Digest + Default> DecisionLoop<'a, D> {
    fn new(options: &'a DedupOptions, cancellation_token: &'a CancellationToken) -> Self {
        Self {
            options,
            cancellation_token,
            index: DedupIndex::new(),
            stats: DedupStats::default(),
        }
    }

    fn run<R: Read, W: Write>(
        mut self,
        reader: R,
        writer: &mut W,
    ) -> Result<DedupStats, DedupError> {
        let mut archive = tar::Archive::new(Tagged::source(reader));
        let mut rewriter = ArchiveRewriter::new(writer);

        let result = self.process(&mut archive, &mut rewriter);

        // The archive reader returns a clean end when the input stops on a block boundary, and
        // reports an undecodable header when it stops inside one.
        let source = archive.into_inner();
        let result = match result {
            Ok(()) if source.reached_eof() => Err(DedupError::SourceReadFailure(Error::new(
                ErrorKind::UnexpectedEof,
                "the archive ended without an end-of-archive marker",
            ))),
            Err(DedupError::MalformedArchive(err)) if source.reached_eof() => {
                Err(DedupError::SourceReadFailure(err))
            }
            result => result,
        };

        if let Err(err) = result {
            rewriter.abandon();
            tracing::debug!("layer rewrite failed after {} entries: {err}", self.stats.entries);
            return Err(err);
        }

        let cancellation_token = self.cancellation_token;
        rewriter
            .finish()
            .map_err(|err| sink_error(cancellation_token, err))?;

        self.stats.unique_contents = self.index.content_count() as u64;
        tracing::info!(
            "rewrote layer with {} entries: {} of {} candidates became hard links, {} bytes saved",
            self.stats.entries,
            self.stats.links,
            self.stats.candidates,
            self.stats.bytes_saved
        );
        Ok(self.stats)
    }

    fn process<R: Read, W: Write>(
        &mut self,
        archive: &mut tar::Archive<Tagged<R>>,
        rewriter: &mut ArchiveRewriter<'_, W>,
    ) -> Result<(), DedupError> {
        let cancellation_token = self.cancellation_token;
        let mut pending = PendingExtensions::default();

        for entry in archive.entries().map_err(classify_header_error)?.raw(true) {
            if cancellation_token.is_cancelled() {
                return Err(DedupError::Cancelled);
            }

            let mut entry = entry.map_err(classify_header_error)?;
            let header = entry.header().clone();
            let size = header.entry_size().map_err(DedupError::MalformedArchive)?;

            if PendingExtensions::is_extension(header.entry_type()) {
                if size > MAX_EXTENSION_SIZE {
                    return Err(DedupError::MalformedArchive(Error::new(
                        ErrorKind::InvalidData,
                        format!(
                            "extension record of {size} bytes exceeds the limit of {MAX_EXTENSION_SIZE} bytes"
                        ),
                    )));
                }
                let mut data = Vec::with_capacity(size as usize);
                ExactReader::new(&mut entry, size)
                    .read_to_end(&mut data)
                    .map_err(|err| classify(err, DedupError::SourceReadFailure))?;
                pending
                    .push(header, data)
                    .map_err(DedupError::MalformedArchive)?;
                continue;
            }

            let extensions = std::mem::take(&mut pending);
            let path = extensions.entry_path(&header).into_owned();
            check_supported(&header, &extensions, &path)?;

            // Global PAX records apply to all following entries and are not entries themselves.
            if header.entry_type() != EntryType::XGlobalHeader {
                self.stats.entries += 1;
                if self.index.is_canonical_path(&path) {
                    tracing::debug!(
                        "{} replaces a canonical file, links to it now resolve to this entry",
                        String::from_utf8_lossy(&path)
                    );
                }
            }

            if header.entry_type().is_file() && self.options.is_candidate_size(size) {
                self.candidate(&mut entry, &header, &extensions, &path, size, rewriter)?;
            } else {
                for record in extensions.records() {
                    rewriter
                        .append_extension(record)
                        .map_err(|err| sink_error(cancellation_token, err))?;
                }
                rewriter
                    .append(&header, ExactReader::new(&mut entry, size))
                    .map_err(|err| sink_error(cancellation_token, err))?;
            }
        }

        if !pending.is_empty() {
            return Err(DedupError::MalformedArchive(Error::new(
                ErrorKind::InvalidData,
                "the archive ends with extension records that do not belong to an entry",
            )));
        }

        Ok(())
    }

    /// Hashes a regular file while spooling its content, then either records it as the canonical
    /// copy or writes a hard link to the canonical copy.
    fn candidate<W: Write>(
        &mut self,
        entry: impl Read,
        header: &Header,
        extensions: &PendingExtensions,
        path: &[u8],
        size: u64,
        rewriter: &mut ArchiveRewriter<'_, W>,
    ) -> Result<(), DedupError> {
        let cancellation_token = self.cancellation_token;
        self.stats.candidates += 1;

        let mut spool = SpooledTempFile::new(self.options.spool_limit);
        let mut hashing_writer = HashingWriter::<_, D>::new(&mut spool);
        std::io::copy(&mut ExactReader::new(entry, size), &mut hashing_writer)
            .map_err(|err| classify(err, DedupError::SpoolFailure))?;
        let (_, digest) = hashing_writer.finalize();

        match self.index.record(digest, path) {
            Recorded::Duplicate(target) => {
                for record in extensions.for_link() {
                    rewriter
                        .append_extension(&record)
                        .map_err(|err| sink_error(cancellation_token, err))?;
                }
                rewriter
                    .append_link(header, target)
                    .map_err(|err| sink_error(cancellation_token, err))?;

                tracing::debug!(
                    "{} => {} ({size} bytes)",
                    String::from_utf8_lossy(path),
                    String::from_utf8_lossy(target)
                );
                self.stats.links += 1;
                self.stats.bytes_saved += size;
            }
            Recorded::Canonical => {
                for record in extensions.records() {
                    rewriter
                        .append_extension(record)
                        .map_err(|err| sink_error(cancellation_token, err))?;
                }
                spool
                    .seek(SeekFrom::Start(0))
                    .map_err(DedupError::SpoolFailure)?;
                rewriter
                    .append(header, Tagged::spool(ExactReader::new(&mut spool, size)))
                    .map_err(|err| sink_error(cancellation_token, err))?;
            }
        }

        Ok(())
    }
}

/// Rejects entries whose data cannot be copied verbatim without decoding it.
fn check_supported(
    header: &Header,
    extensions: &PendingExtensions,
    path: &[u8],
) -> Result<(), DedupError> {
    let unsupported = |reason| DedupError::UnsupportedEntry {
        path: String::from_utf8_lossy(path).into_owned(),
        reason,
    };

    if extensions.pax_value(b"size").is_some() {
        return Err(unsupported(
            "the entry size is overridden by a pax extended header",
        ));
    }
    if header.entry_type().is_gnu_sparse() && header.as_gnu().is_some_and(|gnu| gnu.is_extended())
    {
        return Err(unsupported(
            "the sparse map of the entry continues in extension blocks",
        ));
    }
    Ok(())
}

/// Maps an error of a write to the output. Errors that were raised while reading the source or
/// the spool keep their origin.
fn sink_error(cancellation_token: &CancellationToken, err: Error) -> DedupError {
    classify(err, |err| {
        if cancellation_token.is_cancelled() {
            DedupError::Cancelled
        } else {
            DedupError::SinkWriteFailure(err)
        }
    })
}
