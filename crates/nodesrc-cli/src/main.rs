use anyhow::Result;
use clap::Parser;
use nodesrc_cli::cmd::{generate, populate};
use nodesrc_cli::ui::StderrReporter;
use nodesrc_cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nodesrc=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let reporter = if cli.quiet {
        StderrReporter::quiet()
    } else {
        StderrReporter::new()
    };

    match cli.command {
        Commands::Generate(args) => generate::generate(&args, &reporter).await,
        Commands::PopulatePnpmStore {
            manifest,
            tarball_dir,
            store_dir,
        } => populate::populate_pnpm_store(&manifest, &tarball_dir, &store_dir),
    }
}
