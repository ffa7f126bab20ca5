//! The record of which content has already been written during a pass.

use digest::{Digest, Output};
use std::collections::{HashMap, HashSet};

/// Maps the digest of every canonical file written so far to its path in the archive.
///
/// An index lives for exactly one pass over one archive. Only canonical entries are ever
/// recorded, so a path handed out by [`DedupIndex::record`] always refers to an entry that holds
/// the content itself and never to another link.
///
/// Link targets assume that paths are unique within the archive. If a later entry reuses the
/// path of a canonical file, links recorded against that path are not withdrawn and resolve to
/// whatever the later entry extracts to. Use [`DedupIndex::is_canonical_path`] to detect this.
pub struct DedupIndex<D: Digest> {
    sources: HashMap<Output<D>, Vec<u8>>,
    paths: HashSet<Vec<u8>>,
}

/// The outcome of [`DedupIndex::record`].
#[derive(Debug, PartialEq, Eq)]
pub enum Recorded<'a> {
    /// The content was not seen before; the path is now its canonical location.
    Canonical,

    /// The content was already written at the contained path.
    Duplicate(&'a [u8]),
}

impl<D: Digest> Default for DedupIndex<D> {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
            paths: HashSet::new(),
        }
    }
}

impl<D: Digest> DedupIndex<D> {
    /// Constructs an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `digest` and records `path` as its canonical location if it is not known yet.
    pub fn record(&mut self, digest: Output<D>, path: &[u8]) -> Recorded<'_> {
        match self.sources.entry(digest) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                Recorded::Duplicate(entry.into_mut().as_slice())
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(path.to_vec());
                self.paths.insert(path.to_vec());
                Recorded::Canonical
            }
        }
    }

    /// Returns true if `path` holds the canonical copy of some content.
    pub fn is_canonical_path(&self, path: &[u8]) -> bool {
        self.paths.contains(path)
    }

    /// The number of distinct contents recorded.
    pub fn content_count(&self) -> usize {
        self.sources.len()
    }
}
