//! JSON snapshot persistence.
//!
//! A [`SnapshotStore`] keeps one snapshot per document under its base
//! directory, named by document id. Saving the same document again replaces
//! its snapshot and keeps the previous one as `<id>.json.bak`, so repeated
//! runs over identical input upsert rather than accumulate.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::pipeline::ExtractionResult;

/// Receives finished runs.
pub trait SnapshotSink {
    /// Insert or replace the snapshot for `result.document_id`.
    fn upsert(&self, result: &ExtractionResult) -> Result<PathBuf>;
}

/// On-disk envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub result: ExtractionResult,
}

impl Snapshot {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(result: ExtractionResult) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            saved_at: Utc::now(),
            result,
        }
    }

    /// Read a snapshot file from any location.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&json)?;
        if snapshot.version != Self::CURRENT_VERSION {
            warn!(
                path = %path.display(),
                found = snapshot.version,
                expected = Self::CURRENT_VERSION,
                "Snapshot version mismatch"
            );
        }
        Ok(snapshot)
    }
}

/// Directory of per-document JSON snapshots.
pub struct SnapshotStore {
    base_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path)?;
            info!(path = %self.base_path.display(), "Created snapshot directory");
        }
        Ok(())
    }

    /// Path of the snapshot for `document_id`.
    pub fn snapshot_path(&self, document_id: &str) -> Result<PathBuf> {
        let valid = !document_id.is_empty()
            && document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !document_id.starts_with('.');
        if !valid {
            return Err(EngineError::Storage(format!(
                "document id '{document_id}' cannot be used as a file name"
            )));
        }
        Ok(self.base_path.join(format!("{document_id}.json")))
    }

    fn backup_path(path: &Path) -> PathBuf {
        path.with_extension("json.bak")
    }

    /// Save a run, keeping the previous snapshot of the same document as a backup.
    pub fn save(&self, result: &ExtractionResult) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.snapshot_path(&result.document_id)?;

        if path.exists() {
            let backup = Self::backup_path(&path);
            fs::copy(&path, &backup)?;
            debug!(backup = %backup.display(), "Backed up previous snapshot");
        }

        let json = serde_json::to_string_pretty(&Snapshot::new(result.clone()))?;
        fs::write(&path, json)?;

        info!(
            document_id = %result.document_id,
            nodes = result.tree.len(),
            trees = result.decision_trees.len(),
            path = %path.display(),
            "Saved snapshot"
        );
        Ok(path)
    }

    /// Load the snapshot for `document_id`, if one exists.
    pub fn load(&self, document_id: &str) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(document_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Snapshot::read(&path).map(Some)
    }

    pub fn exists(&self, document_id: &str) -> bool {
        self.snapshot_path(document_id).is_ok_and(|p| p.exists())
    }

    /// Ids of every stored document, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.base_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a document's snapshot and its backup.
    pub fn delete(&self, document_id: &str) -> Result<()> {
        let path = self.snapshot_path(document_id)?;
        let backup = Self::backup_path(&path);
        for file in [&path, &backup] {
            if file.exists() {
                fs::remove_file(file)?;
            }
        }
        info!(document_id, "Deleted snapshot");
        Ok(())
    }
}

impl SnapshotSink for SnapshotStore {
    fn upsert(&self, result: &ExtractionResult) -> Result<PathBuf> {
        self.save(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::DocumentFormat;
    use crate::pipeline::{PolicyPipeline, ProcessOptions};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const POLICY: &str = "Chapter 1: Eligibility\n\n\
        1.1 Age Requirements\n\n\
        The borrower must be at least 18 years old.\n";

    async fn run() -> ExtractionResult {
        PolicyPipeline::default()
            .process_document(POLICY, DocumentFormat::StructuredText, &ProcessOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path().join("snapshots"));
        let result = run().await;

        let path = store.save(&result).unwrap();
        assert!(path.ends_with(format!("{}.json", result.document_id)));
        assert!(store.exists(&result.document_id));

        let loaded = store.load(&result.document_id).unwrap().unwrap();
        assert_eq!(loaded.version, Snapshot::CURRENT_VERSION);
        assert_eq!(loaded.result.tree.len(), result.tree.len());
        assert_eq!(loaded.result.chunks, result.chunks);
        assert_eq!(loaded.result.decision_trees, result.decision_trees);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_backs_up() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        let result = run().await;

        let path = store.upsert(&result).unwrap();
        store.upsert(&result).unwrap();

        assert!(SnapshotStore::backup_path(&path).exists());
        assert_eq!(store.list().unwrap(), vec![result.document_id.clone()]);
    }

    #[test]
    fn test_load_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        assert!(store.load("absent").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let store = SnapshotStore::new("/tmp/snapshots");
        for id in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                store.snapshot_path(id),
                Err(EngineError::Storage(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        let result = run().await;
        store.save(&result).unwrap();
        store.save(&result).unwrap();

        store.delete(&result.document_id).unwrap();
        assert!(!store.exists(&result.document_id));
        assert!(store.list().unwrap().is_empty());
    }
}
