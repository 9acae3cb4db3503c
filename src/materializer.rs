//! Turns clusters into persistent threads.
//!
//! Each cluster is checked against the thread assignments its members already
//! have. Only clusters with no assigned member produce a thread. One existing
//! thread means the work is already done; several mean the members were split
//! on purpose and are left alone. Threads are never merged.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::clustering::Cluster;
use crate::eid::{TenantId, ThreadId};
use crate::threads::{NewThread, Provenance, RelationshipStore};

/// Member titles quoted in a thread description
const DESCRIPTION_TITLES: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub created: Vec<ThreadId>,
    /// Clusters whose members already share one thread
    pub skipped_existing: usize,
    /// Clusters whose members span several threads
    pub skipped_conflicts: usize,
    pub failed: usize,
}

impl MaterializeReport {
    pub fn skipped(&self) -> usize {
        self.skipped_existing + self.skipped_conflicts
    }
}

/// Existing thread situation of a cluster's members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unthreaded,
    AlreadyThreaded(ThreadId),
    Conflict(Vec<ThreadId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(ThreadId),
    Skipped(Resolution),
}

pub struct RelationshipMaterializer {
    store: Arc<dyn RelationshipStore>,
}

impl RelationshipMaterializer {
    pub fn new(store: Arc<dyn RelationshipStore>) -> Self {
        Self { store }
    }

    /// Materialize `clusters` for one tenant. A failing cluster is logged and
    /// counted while the remaining clusters still run.
    pub fn materialize(&self, tenant_id: &TenantId, clusters: &[Cluster], epsilon: f32) -> MaterializeReport {
        let mut report = MaterializeReport::default();

        for cluster in clusters {
            match self.materialize_cluster(tenant_id, cluster, epsilon) {
                Ok(Outcome::Created(thread_id)) => {
                    log::info!(
                        "created thread {thread_id} {:?} with {} items",
                        cluster.title,
                        cluster.members.len()
                    );
                    report.created.push(thread_id);
                }
                Ok(Outcome::Skipped(Resolution::Conflict(thread_ids))) => {
                    log::info!(
                        "cluster {:?} spans {} existing threads, not merging",
                        cluster.title,
                        thread_ids.len()
                    );
                    report.skipped_conflicts += 1;
                }
                Ok(Outcome::Skipped(resolution)) => {
                    log::debug!("cluster {:?} already threaded: {resolution:?}", cluster.title);
                    report.skipped_existing += 1;
                }
                Err(e) => {
                    log::error!(
                        "failed to materialize cluster {:?} ({} items) for tenant {tenant_id}: {e:#}",
                        cluster.title,
                        cluster.members.len()
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    pub fn materialize_cluster(
        &self,
        tenant_id: &TenantId,
        cluster: &Cluster,
        epsilon: f32,
    ) -> anyhow::Result<Outcome> {
        let resolution = self.resolve(cluster)?;
        if resolution != Resolution::Unthreaded {
            return Ok(Outcome::Skipped(resolution));
        }

        let source_types = cluster.source_types();
        let new_thread = NewThread {
            tenant_id: tenant_id.clone(),
            title: cluster.title.clone(),
            description: describe(cluster, &source_types),
            centroid: (!cluster.centroid.is_empty()).then(|| cluster.centroid.clone()),
            provenance: Some(Provenance {
                similarity: cluster.average_similarity,
                member_count: cluster.members.len(),
                source_types,
                keywords: cluster.keywords.clone(),
                epsilon,
            }),
        };

        let thread_id = self
            .store
            .materialize_thread(new_thread, &cluster.member_ids())
            .context("failed to create thread")?;

        Ok(Outcome::Created(thread_id))
    }

    /// Distinct existing threads among the cluster's members.
    pub fn resolve(&self, cluster: &Cluster) -> anyhow::Result<Resolution> {
        let member_ids = cluster.member_ids();
        let assignments = self
            .store
            .find_thread_assignments_for(&member_ids)
            .context("failed to look up thread assignments")?;

        let distinct: BTreeSet<ThreadId> = member_ids
            .iter()
            .filter_map(|id| assignments.get(id).cloned().flatten())
            .collect();

        let mut threads: Vec<ThreadId> = distinct.into_iter().collect();
        Ok(match threads.len() {
            0 => Resolution::Unthreaded,
            1 => Resolution::AlreadyThreaded(threads.remove(0)),
            _ => Resolution::Conflict(threads),
        })
    }
}

/// "3 related items from design, code: A; B; C. Keywords: x, y."
fn describe(cluster: &Cluster, source_types: &[String]) -> String {
    let count = cluster.members.len();
    let mut out = format!("{count} related items");
    if !source_types.is_empty() {
        out.push_str(&format!(" from {}", source_types.join(", ")));
    }

    let titles: Vec<&str> = cluster
        .members
        .iter()
        .map(|m| m.title.trim())
        .filter(|t| !t.is_empty())
        .take(DESCRIPTION_TITLES)
        .collect();
    if !titles.is_empty() {
        out.push_str(": ");
        out.push_str(&titles.join("; "));
        let rest = count.saturating_sub(titles.len());
        if rest > 0 {
            out.push_str(&format!(" and {rest} more"));
        }
    }
    out.push('.');

    if !cluster.keywords.is_empty() {
        out.push_str(&format!(" Keywords: {}.", cluster.keywords.join(", ")));
    }
    out
}
