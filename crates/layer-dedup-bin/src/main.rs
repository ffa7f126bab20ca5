use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;
mod layer;

/// Shrinks container image layers by turning duplicate files into hard links
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log every link that is written
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Rewrite a layer blob, replacing duplicate files with hard links
    Dedup(commands::dedup::Opt),

    /// Report how much a layer would shrink without writing anything
    Scan(commands::scan::Opt),
}

/// Entry point of the `layer-dedup` cli.
#[tokio::main]
async fn main() -> miette::Result<()> {
    // Parse the command line arguments
    let cli = Cli::parse();

    // Setup default logging level
    let default_filter = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;

    // Setup the tracing subscriber. Logs go to stderr so that `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    // Dispatch the selected command
    match cli.command {
        Commands::Dedup(opt) => commands::dedup::dedup(opt).await,
        Commands::Scan(opt) => commands::scan::scan(opt).await,
    }
}
