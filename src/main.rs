use std::sync::Arc;

use clap::Parser;
use chunkstore::catalog::Catalog;
use chunkstore::storage::sqlite::SqliteStore;
use chunkstore::{Result, StoreConfig};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{execute_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(url) = cli.database {
        config = config.with_database_url(url);
    }
    if let Some(chunk_size) = cli.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    config.validate()?;

    let store = SqliteStore::connect(&config).await?;
    let catalog = Catalog::new(Arc::new(store)).with_chunk_size(config.chunk_size)?;

    let outcome = match cli.command {
        Some(command) => execute_command(&catalog, command).await,
        None => Ok(()),
    };

    catalog.close().await;
    outcome
}
