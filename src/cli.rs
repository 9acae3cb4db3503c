use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::semantic::EntityKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one clustering batch over the recent window and print its stats.
    /// Meant to be invoked by an external scheduler such as cron.
    Run {},

    /// Run batches on the configured interval until interrupted
    Daemon {
        /// Override `batch.interval_secs`
        #[clap(long)]
        interval_secs: Option<u64>,
    },

    /// Search items and threads of a tenant
    Search {
        query: String,

        #[clap(short, long)]
        tenant: String,

        #[clap(short, long)]
        limit: Option<usize>,

        /// Cosine distance cutoff
        #[clap(long)]
        threshold: Option<f32>,

        /// Restrict to one kind of entity. Repeatable.
        #[clap(short, long, value_enum)]
        kind: Vec<EntityKind>,
    },

    /// Sweep epsilon candidates for a tenant and print the scores
    Tune {
        #[clap(short, long)]
        tenant: String,
    },

    /// Load items from a JSON array file
    Import { file: PathBuf },

    /// List threads of a tenant
    Threads {
        #[clap(short, long)]
        tenant: String,
    },
}
