use super::FilterArgs;
use crate::layer::FileLayer;
use layer_dedup::tokio::DedupOpener;
use layer_dedup::{LayerAction, MediaType};
use miette::{Context, IntoDiagnostic};
use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
pub struct Opt {
    /// The layer blob to inspect: a tar archive, optionally gzip or zstd compressed
    input: PathBuf,

    /// The media type of the layer, detected from its content if omitted
    #[arg(long)]
    media_type: Option<MediaType>,

    /// Print the statistics as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    filter: FilterArgs,
}

pub async fn scan(opt: Opt) -> miette::Result<()> {
    let layer = FileLayer::detect(&opt.input, opt.media_type).await.into_diagnostic()?;
    let compression = layer.compression();

    let opener = DedupOpener::new(layer, opt.filter.options());
    if opener.action().into_diagnostic()? == LayerAction::PassThrough {
        println!(
            "{} is a foreign layer and would be left unchanged",
            opt.input.display()
        );
        return Ok(());
    }

    // The rewritten archive is produced as usual but thrown away.
    let mut stream = opener.open().await.into_diagnostic()?;
    let copied = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
    let stats = stream
        .finish()
        .await
        .into_diagnostic()
        .with_context(|| format!("failed to scan {}", opt.input.display()))?;
    copied.into_diagnostic()?;

    if opt.json {
        println!("{}", serde_json::to_string_pretty(&stats).into_diagnostic()?);
        return Ok(());
    }

    println!(
        "{} Scanned {} ({compression:?} compressed)",
        console::style("✓").green(),
        opt.input.display()
    );
    println!("  Entries: {}", stats.entries);
    println!("  Candidates: {}", stats.candidates);
    println!("  Unique contents: {}", stats.unique_contents);
    println!("  Links: {}", stats.links);
    println!(
        "  Saved: {}",
        humansize::format_size(stats.bytes_saved, humansize::DECIMAL)
    );

    Ok(())
}
