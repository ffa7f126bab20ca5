//! The boundary to whatever provides the content of a layer: a local image store, a registry
//! client or a plain file.

use crate::DedupError;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::io::AsyncRead;

/// The media type of an image layer as it appears in an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// `application/vnd.oci.image.layer.v1.tar`
    OciLayer,
    /// `application/vnd.oci.image.layer.v1.tar+gzip`
    OciLayerGzip,
    /// `application/vnd.oci.image.layer.v1.tar+zstd`
    OciLayerZstd,
    /// `application/vnd.oci.image.layer.nondistributable.v1.tar`
    OciNondistributableLayer,
    /// `application/vnd.oci.image.layer.nondistributable.v1.tar+gzip`
    OciNondistributableLayerGzip,
    /// `application/vnd.oci.image.layer.nondistributable.v1.tar+zstd`
    OciNondistributableLayerZstd,
    /// `application/vnd.docker.image.rootfs.diff.tar.gzip`
    DockerLayer,
    /// `application/vnd.docker.image.rootfs.foreign.diff.tar.gzip`
    DockerForeignLayer,
    /// Any other media type.
    Other(String),
}

impl MediaType {
    /// Returns the media type string.
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::OciLayer => "application/vnd.oci.image.layer.v1.tar",
            MediaType::OciLayerGzip => "application/vnd.oci.image.layer.v1.tar+gzip",
            MediaType::OciLayerZstd => "application/vnd.oci.image.layer.v1.tar+zstd",
            MediaType::OciNondistributableLayer => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar"
            }
            MediaType::OciNondistributableLayerGzip => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
            }
            MediaType::OciNondistributableLayerZstd => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd"
            }
            MediaType::DockerLayer => "application/vnd.docker.image.rootfs.diff.tar.gzip",
            MediaType::DockerForeignLayer => {
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
            }
            MediaType::Other(media_type) => media_type,
        }
    }

    /// Returns true for layers that are referenced by the image but hosted elsewhere. Their
    /// content must be left exactly as it is.
    pub fn is_foreign(&self) -> bool {
        matches!(
            self,
            MediaType::DockerForeignLayer
                | MediaType::OciNondistributableLayer
                | MediaType::OciNondistributableLayerGzip
                | MediaType::OciNondistributableLayerZstd
        )
    }

    /// Returns the compression of the layer blob, or `None` if the media type is unknown.
    pub fn compression(&self) -> Option<LayerCompression> {
        match self {
            MediaType::OciLayer | MediaType::OciNondistributableLayer => {
                Some(LayerCompression::None)
            }
            MediaType::OciLayerGzip
            | MediaType::OciNondistributableLayerGzip
            | MediaType::DockerLayer
            | MediaType::DockerForeignLayer => Some(LayerCompression::Gzip),
            MediaType::OciLayerZstd | MediaType::OciNondistributableLayerZstd => {
                Some(LayerCompression::Zstd)
            }
            MediaType::Other(_) => None,
        }
    }
}

impl FromStr for MediaType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "application/vnd.oci.image.layer.v1.tar" => MediaType::OciLayer,
            "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::OciLayerGzip,
            "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::OciLayerZstd,
            "application/vnd.oci.image.layer.nondistributable.v1.tar" => {
                MediaType::OciNondistributableLayer
            }
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip" => {
                MediaType::OciNondistributableLayerGzip
            }
            "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
                MediaType::OciNondistributableLayerZstd
            }
            "application/vnd.docker.image.rootfs.diff.tar.gzip" => MediaType::DockerLayer,
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
                MediaType::DockerForeignLayer
            }
            other => MediaType::Other(other.to_owned()),
        })
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a layer blob is compressed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerCompression {
    /// A plain tar archive.
    #[default]
    None,
    /// A gzip compressed tar archive.
    Gzip,
    /// A zstd compressed tar archive.
    Zstd,
}

/// What to do with a layer of a given media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAction {
    /// Rewrite the layer content.
    Dedup,
    /// Forward the layer as an opaque reference without reading its content.
    PassThrough,
}

impl LayerAction {
    /// Foreign layers are passed through, everything else is deduplicated.
    pub fn for_media_type(media_type: &MediaType) -> Self {
        if media_type.is_foreign() {
            LayerAction::PassThrough
        } else {
            LayerAction::Dedup
        }
    }
}

/// Provides the content of a single layer.
///
/// [`LayerSource::open`] may be called more than once; every call must return a reader that
/// starts at the beginning of the layer.
#[async_trait::async_trait]
pub trait LayerSource: Send + Sync {
    /// Returns the media type of the layer.
    fn media_type(&self) -> Result<MediaType, DedupError>;

    /// Opens the uncompressed tar archive of the layer.
    ///
    /// Failures should be reported as [`DedupError::UpstreamResolutionFailure`], see
    /// [`DedupError::upstream`].
    async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, DedupError>;
}
