//! Serializes decided entries into the output archive.

use crate::extensions::ExtensionRecord;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use tar::{Builder, EntryType, Header};

/// The name GNU tar gives to long name and long link records.
const GNU_LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Writes entries to the output archive.
///
/// Pass-through entries are written with their original header block, so they come out byte for
/// byte as they went in apart from the block padding, which is written as zeros. Only
/// [`ArchiveRewriter::finish`] writes the end-of-archive marker; an archive that is
/// [abandoned](ArchiveRewriter::abandon) is left without one so that a consumer can never mistake
/// a partial output for a complete archive.
pub(crate) struct ArchiveRewriter<'w, W: Write> {
    // `tar::Builder` writes the end-of-archive marker when it is dropped.
    builder: ManuallyDrop<Builder<&'w mut W>>,
}

impl<'w, W: Write> ArchiveRewriter<'w, W> {
    pub fn new(writer: &'w mut W) -> Self {
        Self {
            builder: ManuallyDrop::new(Builder::new(writer)),
        }
    }

    /// Writes an extension record unchanged.
    pub fn append_extension(&mut self, record: &ExtensionRecord) -> std::io::Result<()> {
        self.builder.append(&record.header, record.data.as_slice())
    }

    /// Writes `header` unchanged followed by `data`, padded to the next block boundary.
    ///
    /// `data` must produce exactly as many bytes as the header announces. The padding is always
    /// zeros: bytes a source archive kept between the end of the content and the block boundary
    /// are not part of the entry and are not reproduced.
    pub fn append(&mut self, header: &Header, data: impl Read) -> std::io::Result<()> {
        self.builder.append(header, data)
    }

    /// Writes `header` as a hard link to `target`. Every other field of the header is kept.
    pub fn append_link(&mut self, header: &Header, target: &[u8]) -> std::io::Result<()> {
        let mut header = header.clone();
        header.set_entry_type(EntryType::Link);
        header.set_size(0);

        let linkname = &mut header.as_old_mut().linkname;
        linkname.fill(0);
        if target.len() <= linkname.len() {
            linkname[..target.len()].copy_from_slice(target);
        } else {
            let long_link = long_link_header(target.len() as u64 + 1);
            let mut data = Vec::with_capacity(target.len() + 1);
            data.extend_from_slice(target);
            data.push(0);
            self.builder.append(&long_link, data.as_slice())?;

            // Readers use the long link record, the header field holds a truncated copy like
            // GNU tar writes it.
            let linkname = &mut header.as_old_mut().linkname;
            let len = linkname.len();
            linkname.copy_from_slice(&target[..len]);
        }

        header.set_cksum();
        self.builder.append(&header, std::io::empty())
    }

    /// Writes the end-of-archive marker and flushes the writer.
    pub fn finish(self) -> std::io::Result<()> {
        let builder = ManuallyDrop::into_inner(self.builder);
        let writer = builder.into_inner()?;
        writer.flush()
    }

    /// Stops writing without an end-of-archive marker.
    pub fn abandon(self) {}
}

fn long_link_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..GNU_LONG_LINK_NAME.len()].copy_from_slice(GNU_LONG_LINK_NAME);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(EntryType::GNULongLink);
    header.set_size(size);
    header.set_cksum();
    header
}
