use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use fs_err::tokio::File;
use layer_dedup::{DedupError, LayerCompression, LayerSource, MediaType};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// A layer blob stored in a local file.
#[derive(Debug, Clone)]
pub struct FileLayer {
    path: PathBuf,
    compression: LayerCompression,
    media_type: MediaType,
}

impl FileLayer {
    /// Opens the file to find out how it is compressed. Without an explicit media type the OCI
    /// layer media type matching the compression is assumed.
    pub async fn detect(path: &Path, media_type: Option<MediaType>) -> std::io::Result<Self> {
        let mut file = File::open(path).await?;
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            let read = file.read(&mut magic[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        let compression = sniff_compression(&magic[..filled]);
        let media_type = media_type.unwrap_or(match compression {
            LayerCompression::None => MediaType::OciLayer,
            LayerCompression::Gzip => MediaType::OciLayerGzip,
            LayerCompression::Zstd => MediaType::OciLayerZstd,
        });
        tracing::debug!(
            "{} is a {compression:?} compressed layer of type {media_type}",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            media_type,
        })
    }

    /// The path of the blob.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How the blob is compressed.
    pub fn compression(&self) -> LayerCompression {
        self.compression
    }
}

/// Determines the compression of a blob from its first bytes.
fn sniff_compression(magic: &[u8]) -> LayerCompression {
    if magic.starts_with(GZIP_MAGIC) {
        LayerCompression::Gzip
    } else if magic.starts_with(ZSTD_MAGIC) {
        LayerCompression::Zstd
    } else {
        LayerCompression::None
    }
}

#[async_trait::async_trait]
impl LayerSource for FileLayer {
    fn media_type(&self) -> Result<MediaType, DedupError> {
        Ok(self.media_type.clone())
    }

    async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, DedupError> {
        let file = File::open(&self.path).await.map_err(DedupError::upstream)?;
        let reader = BufReader::new(file);
        Ok(match self.compression {
            LayerCompression::None => Box::new(reader),
            LayerCompression::Gzip => {
                let mut decoder = GzipDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(decoder)
            }
            LayerCompression::Zstd => Box::new(ZstdDecoder::new(reader)),
        })
    }
}
