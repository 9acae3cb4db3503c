use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::EnvFilter;

mod cli;
mod clustering;
mod config;
mod eid;
mod items;
mod materializer;
mod orchestrator;
mod semantic;
mod store;
#[cfg(test)]
mod tests;
mod threads;

use config::Config;
use eid::Eid;
use items::Item;
use orchestrator::{BatchOrchestrator, Scheduler};
use semantic::{Embedder, SearchOptions, SemanticSearchService};
use store::CsvStore;
use threads::ThreadRepository;

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("WEAVE_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/weave"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let config = Config::load_with(&base_path()?)?;
    let store = Arc::new(CsvStore::load(config.base_path())?);
    let embedder = Arc::new(Embedder::from_config(&config.embedding, config.base_path()));

    match args.command {
        cli::Command::Run {} => {
            let orchestrator = BatchOrchestrator::new(store, embedder, &config)?;
            let stats = orchestrator.run_once()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        cli::Command::Daemon { interval_secs } => {
            let orchestrator = Arc::new(BatchOrchestrator::new(store, embedder, &config)?);
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.batch.interval_secs));
            let scheduler = Scheduler::new(orchestrator, interval);

            let shutdown = scheduler.shutdown_handle();
            ctrlc::set_handler(move || {
                log::info!("Received shutdown signal");
                shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
            })
            .context("failed to set Ctrl+C handler")?;

            log::info!("running every {}s", interval.as_secs());
            scheduler.run();
        }

        cli::Command::Search {
            query,
            tenant,
            limit,
            threshold,
            kind,
        } => {
            let service = SemanticSearchService::new(embedder, store, config.search.clone());
            let options = SearchOptions {
                limit,
                threshold,
                kinds: kind,
                ..SearchOptions::for_tenant(tenant)
            };
            let response = service.search(&query, &options);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        cli::Command::Tune { tenant } => {
            let orchestrator = BatchOrchestrator::new(store, embedder, &config)?;
            let report = orchestrator.tune(&Eid::from(tenant))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        cli::Command::Import { file } => {
            let data = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let items: Vec<Item> = serde_json::from_str(&data).context("expected a JSON array of items")?;
            let (added, updated) = store.import_items(items)?;
            println!("{added} items added, {updated} updated");
        }

        cli::Command::Threads { tenant } => {
            let threads = store.list_threads(&Eid::from(tenant))?;
            println!("{}", serde_json::to_string_pretty(&threads)?);
        }
    }

    Ok(())
}
