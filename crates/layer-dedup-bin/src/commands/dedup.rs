use super::FilterArgs;
use crate::layer::FileLayer;
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use fs_err::tokio::File;
use layer_dedup::tokio::{DedupOpener, LayerStream};
use layer_dedup::{DedupStats, LayerAction, LayerSource, MediaType, StreamError};
use layer_digest::{serde::OciDigest, HashingWriter, Sha256, Sha256Hash};
use miette::{Context, IntoDiagnostic};
use serde_with::serde_as;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The layer blob to rewrite: a tar archive, optionally gzip or zstd compressed
    input: PathBuf,

    /// Where to write the rewritten layer blob
    #[arg(short, long)]
    output: PathBuf,

    /// How to compress the rewritten layer
    #[arg(long, value_enum, default_value_t = Compression::Gzip)]
    compression: Compression,

    /// The compression level
    #[arg(long, default_value_t = 9)]
    level: i32,

    /// The media type of the input layer, detected from its content if omitted
    #[arg(long)]
    media_type: Option<MediaType>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// The identity of the written layer, as it has to be recorded in the image config and manifest.
#[serde_as]
#[derive(Debug, serde::Serialize)]
struct LayerReport {
    media_type: String,

    /// The digest of the uncompressed archive. Unknown for layers that were copied unchanged.
    #[serde_as(as = "Option<OciDigest>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    diff_id: Option<Sha256Hash>,

    /// The digest of the blob.
    #[serde_as(as = "OciDigest")]
    digest: Sha256Hash,

    size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<DedupStats>,
}

struct WrittenLayer {
    diff_id: Sha256Hash,
    digest: Sha256Hash,
    size: u64,
}

pub async fn dedup(opt: Opt) -> miette::Result<()> {
    let layer = FileLayer::detect(&opt.input, opt.media_type.clone())
        .await
        .into_diagnostic()?;
    let input_media_type = layer.media_type().into_diagnostic()?;

    let opener = DedupOpener::new(layer, opt.filter.options());
    let report = match opener.action().into_diagnostic()? {
        LayerAction::PassThrough => {
            tracing::info!("{input_media_type} is a foreign layer, copying it unchanged");
            copy_unchanged(&opener, &opt).await?
        }
        LayerAction::Dedup => rewrite(&opener, &opt, &input_media_type).await?,
    };

    if opt.json {
        println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
        return Ok(());
    }

    println!(
        "{} Wrote {}",
        console::style("✓").green(),
        opt.output.display()
    );
    if let Some(stats) = &report.stats {
        println!("  Links: {} of {} candidates", stats.links, stats.candidates);
        println!(
            "  Saved: {}",
            humansize::format_size(stats.bytes_saved, humansize::DECIMAL)
        );
    }
    println!("  Media type: {}", report.media_type);
    if let Some(diff_id) = &report.diff_id {
        println!("  Diff ID: {}", layer_digest::oci_digest(diff_id));
    }
    println!("  Digest: {}", layer_digest::oci_digest(&report.digest));
    println!("  Size: {} bytes", report.size);

    Ok(())
}

/// Copies a layer blob without looking at its content.
async fn copy_unchanged(
    opener: &DedupOpener<FileLayer>,
    opt: &Opt,
) -> miette::Result<LayerReport> {
    let layer = opener.source();
    let mut source = File::open(layer.path()).await.into_diagnostic()?;
    let mut writer = HashingWriter::<_, Sha256>::new(create_output(opt).await?);
    let size = tokio::io::copy(&mut source, &mut writer)
        .await
        .into_diagnostic()?;
    writer.shutdown().await.into_diagnostic()?;
    let (_, digest) = writer.finalize();

    Ok(LayerReport {
        media_type: layer.media_type().into_diagnostic()?.to_string(),
        diff_id: None,
        digest,
        size,
        stats: None,
    })
}

/// Runs the deduplication pass and writes its output compressed as requested.
async fn rewrite(
    opener: &DedupOpener<FileLayer>,
    opt: &Opt,
    input_media_type: &MediaType,
) -> miette::Result<LayerReport> {
    let file = create_output(opt).await?;
    let mut stream = opener.open().await.into_diagnostic()?;
    let written = write_layer(&mut stream, file, opt.compression, opt.level).await;
    let outcome = stream.finish().await;

    let result = match (written, outcome) {
        (Ok(written), Ok(stats)) => Ok((written, stats)),
        (Err(err), _) if StreamError::from_io_error(&err).is_none() => Err(err)
            .into_diagnostic()
            .with_context(|| format!("failed to write {}", opt.output.display())),
        (_, Err(err)) => Err(err)
            .into_diagnostic()
            .with_context(|| format!("failed to rewrite {}", opt.input.display())),
        (Err(err), Ok(_)) => Err(err).into_diagnostic(),
    };

    // A partial archive must not be mistaken for a layer.
    if result.is_err() {
        let _ = fs_err::tokio::remove_file(&opt.output).await;
    }
    let (written, stats) = result?;

    Ok(LayerReport {
        media_type: output_media_type(input_media_type, opt.compression).to_string(),
        diff_id: Some(written.diff_id),
        digest: written.digest,
        size: written.size,
        stats: Some(stats),
    })
}

async fn create_output(opt: &Opt) -> miette::Result<File> {
    File::create(&opt.output).await.into_diagnostic()
}

/// Keeps the Docker media type for Docker layers if the compression allows it.
fn output_media_type(input: &MediaType, compression: Compression) -> MediaType {
    match (input, compression) {
        (MediaType::DockerLayer, Compression::Gzip) => MediaType::DockerLayer,
        (_, Compression::None) => MediaType::OciLayer,
        (_, Compression::Gzip) => MediaType::OciLayerGzip,
        (_, Compression::Zstd) => MediaType::OciLayerZstd,
    }
}

async fn write_layer(
    stream: &mut LayerStream,
    file: File,
    compression: Compression,
    level: i32,
) -> std::io::Result<WrittenLayer> {
    let blob = HashingWriter::<_, Sha256>::new(file);
    let (blob, diff_id) = match compression {
        Compression::None => copy_hashed(stream, blob).await?,
        Compression::Gzip => {
            let encoder = GzipEncoder::with_quality(blob, Level::Precise(level));
            let (encoder, diff_id) = copy_hashed(stream, encoder).await?;
            (encoder.into_inner(), diff_id)
        }
        Compression::Zstd => {
            let encoder = ZstdEncoder::with_quality(blob, Level::Precise(level));
            let (encoder, diff_id) = copy_hashed(stream, encoder).await?;
            (encoder.into_inner(), diff_id)
        }
    };
    let (file, digest) = blob.finalize();
    let size = file.metadata().await?.len();

    Ok(WrittenLayer {
        diff_id,
        digest,
        size,
    })
}

/// Copies the stream into `writer` and returns the digest of everything that was copied.
async fn copy_hashed<W: AsyncWrite + Unpin>(
    stream: &mut LayerStream,
    writer: W,
) -> std::io::Result<(W, Sha256Hash)> {
    let mut writer = HashingWriter::<_, Sha256>::new(writer);
    tokio::io::copy(stream, &mut writer).await?;
    writer.shutdown().await?;
    Ok(writer.finalize())
}
