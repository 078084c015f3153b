use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for an artifact record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Checkpoint,
    Model,
    Report,
}

/// Immutable metadata record for a file produced by a job.
///
/// Only the metadata and locator live here; file bytes belong to an external
/// storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub kind: ArtifactKind,
    pub name: String,
    /// Opaque locator handed to the storage layer.
    pub path: String,
    /// Size in bytes as reported by the producer.
    pub size: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    #[must_use]
    pub fn new(
        job_id: JobId,
        kind: ArtifactKind,
        name: impl Into<String>,
        size: u64,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let name = name.into();
        let path = format!("/artifacts/{job_id}/{name}");
        Self {
            id: ArtifactId::new(),
            job_id,
            kind,
            name,
            path,
            size,
            metadata,
            created_at: Utc::now(),
        }
    }
}
