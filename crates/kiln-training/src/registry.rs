//! Concurrency-safe registry of jobs and their artifacts.
//!
//! The registry map is the only mutable structure shared across training
//! tasks; everything job-local lives behind that job's [`JobHandle`].

use crate::artifacts::{Artifact, ArtifactId};
use crate::handle::JobHandle;
use crate::job::{Job, JobId, JobStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default maximum number of retained jobs.
pub const DEFAULT_MAX_RETAINED_JOBS: usize = 100;

/// Registry mapping job ids to their state machine instances, with a
/// capacity cap enforced by evicting the oldest terminal jobs.
pub struct RunRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
    max_retained: usize,
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("max_retained", &self.max_retained)
            .finish_non_exhaustive()
    }
}

impl RunRegistry {
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
            max_retained: max_retained.max(1),
        }
    }

    #[must_use]
    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    /// Registers a job and re-checks the retention cap.
    pub async fn insert(&self, handle: Arc<JobHandle>) {
        let id = handle.id().clone();
        debug!(job_id = %id, "registering job");
        {
            let mut jobs = self.jobs.write().await;
            if jobs.insert(id.clone(), handle).is_some() {
                warn!(job_id = %id, "job replaced in registry");
            }
        }
        self.evict_over_cap().await;
    }

    /// Evicts oldest-by-creation terminal jobs until the registry is back
    /// at or under its cap.
    ///
    /// Live jobs are never evicted, so the registry may transiently exceed
    /// the cap while every excess job is still running.
    async fn evict_over_cap(&self) {
        let handles: Vec<Arc<JobHandle>> = {
            let jobs = self.jobs.read().await;
            if jobs.len() <= self.max_retained {
                return;
            }
            jobs.values().cloned().collect()
        };
        let excess = handles.len().saturating_sub(self.max_retained);

        // Terminal status is sticky, so a candidate stays evictable once
        // observed terminal here.
        let mut candidates = Vec::new();
        for handle in &handles {
            let job = handle.snapshot().await;
            if job.status.is_terminal() {
                candidates.push((job.created_at, job.id, job.artifact_ids));
            }
        }
        candidates.sort_by_key(|(created_at, _, _)| *created_at);
        candidates.truncate(excess);
        if candidates.is_empty() {
            return;
        }

        {
            let mut jobs = self.jobs.write().await;
            for (_, id, _) in &candidates {
                jobs.remove(id);
            }
        }
        let mut artifacts = self.artifacts.write().await;
        for (_, id, artifact_ids) in candidates {
            for artifact_id in &artifact_ids {
                artifacts.remove(artifact_id);
            }
            info!(job_id = %id, artifacts = artifact_ids.len(), "evicted retained job");
        }
    }

    pub async fn get(&self, id: &JobId) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Lists job snapshots newest-first, optionally filtered by status and
    /// capped to `limit` results.
    pub async fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            let job = handle.snapshot().await;
            if status.is_none_or(|s| job.status == s) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Removes a job and its artifacts.
    pub async fn remove(&self, id: &JobId) -> bool {
        let removed = self.jobs.write().await.remove(id);
        let Some(handle) = removed else {
            return false;
        };
        let artifact_ids = handle.snapshot().await.artifact_ids;
        let mut artifacts = self.artifacts.write().await;
        for artifact_id in &artifact_ids {
            artifacts.remove(artifact_id);
        }
        debug!(job_id = %id, "removed job");
        true
    }

    pub async fn count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Records artifact metadata produced by a job.
    pub async fn add_artifact(&self, artifact: Artifact) {
        debug!(
            job_id = %artifact.job_id,
            artifact_id = %artifact.id,
            kind = ?artifact.kind,
            "recording artifact"
        );
        self.artifacts.write().await.insert(artifact.id.clone(), artifact);
    }

    pub async fn artifact(&self, id: &ArtifactId) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    /// Drops one artifact record.
    pub async fn remove_artifact(&self, id: &ArtifactId) -> bool {
        self.artifacts.write().await.remove(id).is_some()
    }

    /// Resolves a job's artifact references, preserving order.
    pub async fn artifacts_for(&self, ids: &[ArtifactId]) -> Vec<Artifact> {
        let artifacts = self.artifacts.read().await;
        ids.iter().filter_map(|id| artifacts.get(id).cloned()).collect()
    }

    pub async fn artifact_count(&self) -> usize {
        self.artifacts.read().await.len()
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED_JOBS)
    }
}
