use layer_dedup::{DedupOptions, DigestAlgorithm, DEFAULT_THRESHOLD};

pub mod dedup;
pub mod scan;

/// Flags that tune the deduplication pass.
#[derive(Debug, clap::Args)]
pub struct FilterArgs {
    /// Only files larger than this many bytes are turned into hard links
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u64,

    /// The digest used to compare file contents (md5, sha256 or blake2b256)
    #[arg(long, default_value_t = DigestAlgorithm::default())]
    digest: DigestAlgorithm,

    /// Files are buffered in memory up to this many bytes, larger files spill to a temporary file
    #[arg(long, default_value_t = DedupOptions::default().spool_limit)]
    spool_limit: usize,
}

impl FilterArgs {
    pub fn options(&self) -> DedupOptions {
        DedupOptions::default()
            .with_threshold(self.threshold)
            .with_digest(self.digest)
            .with_spool_limit(self.spool_limit)
    }
}
