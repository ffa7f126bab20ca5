use layer_digest::DigestAlgorithm;
use serde::{Deserialize, Serialize};

/// Regular files of this size or smaller are never turned into links by default. A hard link
/// entry still costs a 512 byte header, so small files are not worth the bookkeeping.
pub const DEFAULT_THRESHOLD: u64 = 10_000;

/// Configures a deduplication pass.
///
/// Every field has a default, so partial configurations can be deserialized:
///
/// ```
/// use layer_dedup::{DedupOptions, DigestAlgorithm};
///
/// let options: DedupOptions = serde_json::from_str(r#"{ "threshold": 4096, "digest": "md5" }"#).unwrap();
/// assert_eq!(options.threshold, 4096);
/// assert_eq!(options.digest, DigestAlgorithm::Md5);
/// assert_eq!(options.chunk_size, DedupOptions::default().chunk_size);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DedupOptions {
    /// Only regular files strictly larger than this many bytes are considered for linking.
    pub threshold: u64,

    /// The digest used as equality key for file content.
    pub digest: DigestAlgorithm,

    /// Candidate files are buffered in memory up to this many bytes and spill to a temporary
    /// file beyond it.
    pub spool_limit: usize,

    /// The number of chunks the pipe between producer and consumer holds before the producer
    /// blocks.
    pub channel_capacity: usize,

    /// The size of the chunks handed from the producer to the consumer.
    pub chunk_size: usize,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            digest: DigestAlgorithm::default(),
            spool_limit: 16 * 1024 * 1024,
            channel_capacity: 16,
            chunk_size: 64 * 1024,
        }
    }
}

impl DedupOptions {
    /// Sets the size threshold for link candidates.
    pub fn with_threshold(self, threshold: u64) -> Self {
        Self { threshold, ..self }
    }

    /// Sets the digest used to compare file contents.
    pub fn with_digest(self, digest: DigestAlgorithm) -> Self {
        Self { digest, ..self }
    }

    /// Sets how many bytes of a candidate file are buffered in memory.
    pub fn with_spool_limit(self, spool_limit: usize) -> Self {
        Self {
            spool_limit,
            ..self
        }
    }

    /// Sets the number of chunks buffered between producer and consumer.
    pub fn with_channel_capacity(self, channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            ..self
        }
    }

    /// Sets the size of the chunks handed to the consumer.
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }

    /// Returns true if a regular file of `size` bytes is a link candidate. The boundary is
    /// exclusive and empty files never qualify.
    pub fn is_candidate_size(&self, size: u64) -> bool {
        size > 0 && size > self.threshold
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10_000, 9_999, false)]
    #[case(10_000, 10_000, false)]
    #[case(10_000, 10_001, true)]
    #[case(0, 0, false)]
    #[case(0, 1, true)]
    fn test_candidate_boundary(#[case] threshold: u64, #[case] size: u64, #[case] expected: bool) {
        let options = DedupOptions::default().with_threshold(threshold);
        assert_eq!(options.is_candidate_size(size), expected);
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let options: DedupOptions =
            serde_json::from_str(r#"{ "spool-limit": 1024, "channel-capacity": 2 }"#).unwrap();
        assert_eq!(options.spool_limit, 1024);
        assert_eq!(options.channel_capacity, 2);
        assert_eq!(options.threshold, DEFAULT_THRESHOLD);
        assert_eq!(options.digest, DigestAlgorithm::Sha256);
    }
}
