//! Periodic multi-tenant clustering runs.
//!
//! One run fetches a bounded window of recent items across all tenants,
//! groups them by tenant and processes every tenant on its own: embedding
//! backfill, optional epsilon tuning, clustering, materialization. Tenants
//! share no mutable state and run in parallel on a dedicated rayon pool; a
//! failing (or panicking) tenant is logged and counted without affecting the
//! others.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;

use crate::clustering::{cluster_items, tune_epsilon, DbscanParams, TuningRange, TuningReport};
use crate::config::{BatchConfig, ClusteringConfig, Config, TuningConfig};
use crate::eid::{ItemId, TenantId};
use crate::items::Item;
use crate::materializer::RelationshipMaterializer;
use crate::semantic::{item_text, Embedder};
use crate::threads::RelationshipStore;

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub tenants_processed: usize,
    pub tenants_failed: usize,
    pub items_considered: usize,
    pub embeddings_backfilled: usize,
    pub clusters_found: usize,
    pub threads_created: usize,
    pub clusters_skipped: usize,
    pub clusters_failed: usize,
    pub elapsed_ms: f64,
}

impl BatchStats {
    fn absorb(&mut self, tenant: &TenantStats) {
        self.tenants_processed += 1;
        self.items_considered += tenant.items_considered;
        self.embeddings_backfilled += tenant.embeddings_backfilled;
        self.clusters_found += tenant.clusters_found;
        self.threads_created += tenant.threads_created;
        self.clusters_skipped += tenant.clusters_skipped;
        self.clusters_failed += tenant.clusters_failed;
    }
}

/// Counters for a single tenant's pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TenantStats {
    pub items_considered: usize,
    pub embeddings_backfilled: usize,
    pub clusters_found: usize,
    pub threads_created: usize,
    pub clusters_skipped: usize,
    pub clusters_failed: usize,
    pub epsilon: f32,
}

pub struct BatchOrchestrator {
    store: Arc<dyn RelationshipStore>,
    embedder: Arc<Embedder>,
    materializer: RelationshipMaterializer,
    clustering: ClusteringConfig,
    tuning: TuningConfig,
    batch: BatchConfig,
    pool: rayon::ThreadPool,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<dyn RelationshipStore>, embedder: Arc<Embedder>, config: &Config) -> anyhow::Result<Self> {
        DbscanParams::from_config(&config.clustering)?;
        if config.tuning.enabled {
            TuningRange::from_config(&config.tuning)?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.batch.tenant_parallelism.max(1))
            .thread_name(|i| format!("weave-tenant-{i}"))
            .build()
            .context("failed to build tenant thread pool")?;

        Ok(Self {
            materializer: RelationshipMaterializer::new(store.clone()),
            store,
            embedder,
            clustering: config.clustering.clone(),
            tuning: config.tuning.clone(),
            batch: config.batch.clone(),
            pool,
        })
    }

    /// Process the current window once. Only failing to read the window is an
    /// error; tenant failures end up in the returned counters.
    pub fn run_once(&self) -> anyhow::Result<BatchStats> {
        let started = Instant::now();
        let window_start = Utc::now() - chrono::Duration::hours(i64::from(self.batch.window_hours));

        let items = self
            .store
            .fetch_recent_items(None, window_start, self.batch.item_limit_per_run)
            .context("failed to fetch recent items")?;

        let mut by_tenant: BTreeMap<TenantId, Vec<Item>> = BTreeMap::new();
        for item in items {
            by_tenant.entry(item.tenant_id.clone()).or_default().push(item);
        }
        let groups: Vec<(TenantId, Vec<Item>)> = by_tenant.into_iter().collect();

        log::info!(
            "batch run over {} tenants since {}",
            groups.len(),
            window_start.to_rfc3339()
        );

        let outcomes: Vec<(TenantId, usize, Result<TenantStats, String>)> = self.pool.install(|| {
            groups
                .into_par_iter()
                .map(|(tenant_id, items)| {
                    let count = items.len();
                    let result = match catch_unwind(AssertUnwindSafe(|| self.process_tenant(&tenant_id, items))) {
                        Ok(Ok(stats)) => Ok(stats),
                        Ok(Err(e)) => Err(format!("{e:#}")),
                        Err(panic) => Err(panic_message(&*panic)),
                    };
                    (tenant_id, count, result)
                })
                .collect()
        });

        let mut stats = BatchStats::default();
        for (tenant_id, count, result) in outcomes {
            match result {
                Ok(tenant) => stats.absorb(&tenant),
                Err(msg) => {
                    log::error!("tenant {tenant_id} failed ({count} items): {msg}");
                    stats.tenants_failed += 1;
                }
            }
        }
        stats.elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;

        log::info!(
            "batch done: {} tenants ok, {} failed, {} clusters, {} threads created in {}ms",
            stats.tenants_processed,
            stats.tenants_failed,
            stats.clusters_found,
            stats.threads_created,
            stats.elapsed_ms
        );

        Ok(stats)
    }

    /// Backfill, cluster and materialize one tenant's items.
    pub fn process_tenant(&self, tenant_id: &TenantId, mut items: Vec<Item>) -> anyhow::Result<TenantStats> {
        let span = tracing::info_span!("tenant", tenant_id = %tenant_id, items = items.len());
        let _enter = span.enter();

        let mut stats = TenantStats {
            epsilon: self.clustering.epsilon,
            ..Default::default()
        };

        if self.batch.backfill_embeddings {
            stats.embeddings_backfilled = self.backfill(&mut items)?;
        }

        items.retain(Item::has_embedding);
        stats.items_considered = items.len();
        if items.len() < self.clustering.min_points {
            log::debug!("only {} embedded items, nothing to cluster", items.len());
            return Ok(stats);
        }

        if self.tuning.enabled {
            let report = tune_epsilon(&items, &TuningRange::from_config(&self.tuning)?)?;
            match report.accepted_epsilon() {
                Some(epsilon) => {
                    log::debug!("tuned epsilon {epsilon:.3} (score {:.4})", report.best_score);
                    stats.epsilon = epsilon;
                }
                None => log::debug!("tuning found no partition, keeping epsilon {}", stats.epsilon),
            }
        }

        let params = DbscanParams::from_config(&self.clustering)?.with_epsilon(stats.epsilon)?;
        let outcome = cluster_items(&items, &params)?;
        stats.clusters_found = outcome.clusters.len();
        log::debug!(
            "{} clusters, {} noise items at epsilon {:.3}",
            outcome.clusters.len(),
            outcome.noise.len(),
            stats.epsilon
        );

        let report = self.materializer.materialize(tenant_id, &outcome.clusters, stats.epsilon);
        stats.threads_created = report.created.len();
        stats.clusters_skipped = report.skipped();
        stats.clusters_failed = report.failed;

        Ok(stats)
    }

    /// Embed items that have none yet and persist the new vectors. Items that
    /// still cannot be embedded stay without one.
    fn backfill(&self, items: &mut [Item]) -> anyhow::Result<usize> {
        if !self.embedder.is_available() {
            return Ok(0);
        }

        let (positions, texts): (Vec<usize>, Vec<String>) = items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.has_embedding())
            .filter_map(|(idx, item)| item_text(&item.title, &item.description).map(|t| (idx, t)))
            .unzip();
        if texts.is_empty() {
            return Ok(0);
        }

        let vectors = self.embedder.embed_batch(&texts);
        let mut fresh: Vec<(ItemId, Vec<f32>)> = Vec::new();
        for (idx, vector) in positions.into_iter().zip(vectors) {
            if let Some(vector) = vector {
                fresh.push((items[idx].id.clone(), vector.clone()));
                items[idx].embedding = Some(vector);
            }
        }

        if !fresh.is_empty() {
            if let Err(e) = self.store.store_embeddings(&fresh) {
                log::warn!("failed to persist {} embeddings: {e:#}", fresh.len());
            }
        }
        log::debug!("backfilled {}/{} embeddings", fresh.len(), texts.len());

        Ok(fresh.len())
    }

    /// Run the epsilon sweep for one tenant's current window.
    pub fn tune(&self, tenant_id: &TenantId) -> anyhow::Result<TuningReport> {
        let window_start = Utc::now() - chrono::Duration::hours(i64::from(self.batch.window_hours));
        let items = self
            .store
            .fetch_recent_items(Some(tenant_id), window_start, self.batch.item_limit_per_run)
            .context("failed to fetch recent items")?;
        let items: Vec<Item> = items.into_iter().filter(Item::has_embedding).collect();

        Ok(tune_epsilon(&items, &TuningRange::from_config(&self.tuning)?)?)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Fixed-interval trigger for [`BatchOrchestrator::run_once`].
pub struct Scheduler {
    orchestrator: Arc<BatchOrchestrator>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the loop after the current run.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested. Returns the number of completed runs.
    pub fn run(&self) -> usize {
        let mut runs = 0;

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.orchestrator.run_once() {
                Ok(_) => {}
                Err(e) => log::error!("batch run failed: {e:#}"),
            }
            runs += 1;

            let next = Instant::now() + self.interval;
            while Instant::now() < next {
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                sleep(Duration::from_millis(100));
            }
        }

        log::info!("scheduler stopped after {runs} runs");
        runs
    }
}
