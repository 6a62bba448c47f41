use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use intra_extract::{config::Config, extractor::Extractor, jobs, store::DataStore};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
/// Extracts datasets from the intra API into JSON files in the data directory.
///
/// Settings come from the environment (or a `.env` file): CLIENT_ID,
/// CLIENT_SECRET, TOKEN_URL, REQ_URL, and optionally DATA_DIR and
/// SECRET_STORE_ID.
struct Args {
    /// Which extraction to run
    job: jobs::Job,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                [
                    "extract=info",       // code in this file
                    "intra_extract=debug", // code in this crate (but not this file)
                ]
                .join(",")
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Args { job } = Args::parse();

    let config = Config::load().context("failed to load configuration")?;
    let store = DataStore::new(&config.data_dir);
    let extractor = Extractor::from_config(&config)
        .await
        .context("failed to authenticate against the intra API")?;

    let written = jobs::run(job, &extractor, &store)
        .await
        .with_context(|| format!("{job} extraction failed"))?;

    let missing: Vec<_> = written.iter().filter(|name| !store.exists(name)).collect();
    if !missing.is_empty() {
        for name in missing {
            error!("unable to save {}", store.path_for(name).display());
        }
        return Ok(ExitCode::FAILURE);
    }

    info!("{} data saved successfully", job);
    Ok(ExitCode::SUCCESS)
}
