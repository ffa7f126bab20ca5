//! Extension records that precede an entry: GNU long names, GNU long link targets and PAX
//! local headers.
//!
//! The archive is read in raw mode so that these records can be written back exactly as they
//! were read. They are collected here until the entry they describe arrives.

use std::borrow::Cow;
use std::io::{Error, ErrorKind};
use tar::{EntryType, Header};

/// Extension payloads larger than this are rejected instead of being buffered.
pub(crate) const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

#[derive(Clone)]
pub(crate) struct ExtensionRecord {
    pub header: Header,
    pub data: Vec<u8>,
}

/// The extension records seen since the last entry.
#[derive(Default)]
pub(crate) struct PendingExtensions {
    records: Vec<ExtensionRecord>,
}

impl PendingExtensions {
    /// Returns true for record types that belong to the entry that follows them.
    pub fn is_extension(entry_type: EntryType) -> bool {
        entry_type.is_gnu_longname()
            || entry_type.is_gnu_longlink()
            || entry_type.is_pax_local_extensions()
    }

    /// Adds a record. PAX payloads are validated immediately.
    pub fn push(&mut self, header: Header, data: Vec<u8>) -> Result<(), Error> {
        if header.entry_type().is_pax_local_extensions() {
            parse_pax_records(&data)?;
        }
        self.records.push(ExtensionRecord { header, data });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ExtensionRecord] {
        &self.records
    }

    /// Returns the last value of a PAX key.
    pub fn pax_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.records
            .iter()
            .filter(|record| record.header.entry_type().is_pax_local_extensions())
            .flat_map(|record| parse_pax_records(&record.data).unwrap_or_default())
            .filter(|record| record.key == key)
            .map(|record| record.value)
            .last()
    }

    /// Returns the path of the entry as overridden by a PAX `path` or a GNU long name.
    pub fn path(&self) -> Option<&[u8]> {
        if let Some(path) = self.pax_value(b"path") {
            return Some(path);
        }
        self.records
            .iter()
            .filter(|record| record.header.entry_type().is_gnu_longname())
            .map(|record| trim_nul(&record.data))
            .last()
    }

    /// Returns the logical path of the entry with `header`.
    pub fn entry_path<'a>(&'a self, header: &'a Header) -> Cow<'a, [u8]> {
        match self.path() {
            Some(path) => Cow::Borrowed(path),
            None => header.path_bytes(),
        }
    }

    /// Returns the records to emit in front of an entry that is rewritten into a hard link.
    ///
    /// GNU long link records are dropped because the link target is replaced, and so are
    /// `linkpath` keys of PAX records. PAX records that end up empty are dropped completely.
    pub fn for_link(&self) -> Vec<Cow<'_, ExtensionRecord>> {
        let mut records = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let entry_type = record.header.entry_type();
            if entry_type.is_gnu_longlink() {
                continue;
            }
            if !entry_type.is_pax_local_extensions() {
                records.push(Cow::Borrowed(record));
                continue;
            }

            let pax = parse_pax_records(&record.data).unwrap_or_default();
            if pax.iter().all(|pax| pax.key != b"linkpath") {
                records.push(Cow::Borrowed(record));
                continue;
            }

            let data: Vec<u8> = pax
                .iter()
                .filter(|pax| pax.key != b"linkpath")
                .flat_map(|pax| pax.raw.iter().copied())
                .collect();
            if data.is_empty() {
                continue;
            }
            let mut header = record.header.clone();
            header.set_size(data.len() as u64);
            header.set_cksum();
            records.push(Cow::Owned(ExtensionRecord { header, data }));
        }
        records
    }
}

fn trim_nul(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |position| position + 1);
    &data[..end]
}

/// One `<length> <key>=<value>\n` record of a PAX extended header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PaxRecord<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// The complete record including the length prefix and the newline.
    pub raw: &'a [u8],
}

pub(crate) fn parse_pax_records(mut data: &[u8]) -> Result<Vec<PaxRecord<'_>>, Error> {
    let invalid =
        |msg: &str| Error::new(ErrorKind::InvalidData, format!("malformed pax record: {msg}"));

    let mut records = Vec::new();
    // Some writers pad the payload with NULs.
    while !data.is_empty() && data[0] != 0 {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| invalid("missing length"))?;
        let len: usize = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|len| len.parse().ok())
            .ok_or_else(|| invalid("invalid length"))?;
        if len <= space + 1 || len > data.len() || data[len - 1] != b'\n' {
            return Err(invalid("length does not match the record"));
        }

        let (raw, rest) = data.split_at(len);
        let body = &raw[space + 1..len - 1];
        let equals = body
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| invalid("missing '='"))?;
        records.push(PaxRecord {
            key: &body[..equals],
            value: &body[equals + 1..],
            raw,
        });
        data = rest;
    }
    Ok(records)
}

/// Encodes a single PAX record. The length prefix counts itself.
#[cfg(test)]
pub(crate) fn encode_pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let payload = key.len() + value.len() + 3;
    let mut len = payload;
    loop {
        let total = payload + len.to_string().len();
        if total == len {
            break;
        }
        len = total;
    }

    let mut record = format!("{len} {key}=").into_bytes();
    record.extend_from_slice(value);
    record.push(b'\n');
    record
}
