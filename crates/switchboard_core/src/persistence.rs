//! Snapshot persistence seam.
//!
//! The learning system flushes a `LearningSnapshot` every N interactions;
//! where it lands is the caller's business. `SnapshotStore` is the
//! boundary: `JsonFileStore` writes pretty JSON to a path, `MemoryStore`
//! keeps the latest snapshot for tests. The snapshot layout is not a wire
//! contract - it round-trips through this crate only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SwitchboardError;
use crate::learning::{Interaction, QueryPattern, ServerUsage};

/// Durable view of the learning state: the interaction tail, the pattern
/// table, and per-server usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSnapshot {
    pub interactions: Vec<Interaction>,
    pub patterns: HashMap<String, QueryPattern>,
    pub server_metrics: HashMap<String, ServerUsage>,
    pub saved_at: DateTime<Utc>,
}

/// Where snapshots go. Implementations must tolerate concurrent callers;
/// the orchestrator serializes saves but loads may race a save.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), SwitchboardError>;

    /// The latest snapshot, or `None` when nothing was ever saved.
    async fn load(&self) -> Result<Option<LearningSnapshot>, SwitchboardError>;
}

// ============================================================================
// JSON File Store
// ============================================================================

/// Snapshot store backed by a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), SwitchboardError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rendered = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&self.path, rendered).await?;
        debug!(
            path = %self.path.display(),
            interactions = snapshot.interactions.len(),
            "Snapshot written"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<LearningSnapshot>, SwitchboardError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&raw)?;
        Ok(Some(snapshot))
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory store holding only the latest snapshot. For tests and
/// deployments that opt out of durability.
#[derive(Default)]
pub struct MemoryStore {
    latest: Mutex<Option<LearningSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), SwitchboardError> {
        *self.latest.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<LearningSnapshot>, SwitchboardError> {
        Ok(self.latest.lock().await.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
