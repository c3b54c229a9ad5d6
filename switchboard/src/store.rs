//! Persisted environment registry and active-selection state.
//!
//! One store instance owns one state file. Mutations are serialized through
//! a single-writer queue and written with a temp-file-then-rename so a
//! concurrent reader of the file never observes a partial document.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::rewrite::{self, UrlError};

/// One saved backend environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRecord {
    pub id: String,
    pub label: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The forwarding target currently in effect. `environment_id` is `None`
/// when the url is an ad-hoc override not backed by a saved record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSelection {
    pub url: Option<String>,
    pub environment_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no environment exists with id {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] UrlError),

    #[error("failed to persist state to {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
struct PersistedState {
    environments: Vec<EnvironmentRecord>,
    active_environment_id: Option<String>,
    active_environment_url: Option<String>,
}

/// On-disk document. Written with both the current and the legacy field
/// names; the legacy set stays until a deliberate deprecation point.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedDocument<'a> {
    environments: &'a [EnvironmentRecord],
    active_environment_id: &'a Option<String>,
    active_environment_url: &'a Option<String>,
    targets: &'a [EnvironmentRecord],
    active_target_id: &'a Option<String>,
    active_target_url: &'a Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LoadedDocument {
    environments: Option<Vec<EnvironmentRecord>>,
    active_environment_id: Option<String>,
    active_environment_url: Option<String>,
    targets: Option<Vec<EnvironmentRecord>>,
    active_target_id: Option<String>,
    active_target_url: Option<String>,
}

impl LoadedDocument {
    fn into_state(self) -> PersistedState {
        PersistedState {
            environments: self.environments.or(self.targets).unwrap_or_default(),
            active_environment_id: self.active_environment_id.or(self.active_target_id),
            active_environment_url: self.active_environment_url.or(self.active_target_url),
        }
    }
}

pub struct EnvironmentStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
    init: OnceCell<()>,
    writer: Mutex<()>,
}

impl EnvironmentStore {
    /// A store bound to the given state file. Nothing is read until
    /// [`init`](Self::init) runs.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(PersistedState::default()),
            init: OnceCell::new(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the state file, or create it empty when missing. Idempotent;
    /// concurrent callers all observe the same completed load.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.init.get_or_try_init(|| self.load_from_disk()).await?;
        Ok(())
    }

    async fn load_from_disk(&self) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<LoadedDocument>(&bytes) {
                Ok(document) => {
                    *self.state.write().unwrap() = document.into_state();
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        %error,
                        "state file is unreadable, reinitializing with empty state"
                    );
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Persistence {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        let empty = PersistedState::default();
        self.write_file(&empty).await?;
        *self.state.write().unwrap() = empty;
        Ok(())
    }

    pub fn active_selection(&self) -> ActiveSelection {
        let state = self.state.read().unwrap();
        ActiveSelection {
            url: state.active_environment_url.clone(),
            environment_id: state.active_environment_id.clone(),
        }
    }

    /// Owned copy of every saved environment, in insertion order.
    pub fn environments(&self) -> Vec<EnvironmentRecord> {
        self.state.read().unwrap().environments.clone()
    }

    pub fn environment(&self, id: &str) -> Option<EnvironmentRecord> {
        self.state
            .read()
            .unwrap()
            .environments
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Make a saved environment the forwarding target.
    pub async fn set_active_environment_by_id(
        &self,
        id: &str,
    ) -> Result<EnvironmentRecord, StoreError> {
        self.mutate(|state| {
            let record = state
                .environments
                .iter()
                .find(|record| record.id == id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            state.active_environment_id = Some(record.id.clone());
            state.active_environment_url = Some(record.url.clone());
            Ok(record)
        })
        .await
    }

    /// Make an ad-hoc URL the forwarding target. An explicit URL always
    /// supersedes a saved record reference, so the id is cleared.
    pub async fn set_active_environment_url(&self, url: &str) -> Result<String, StoreError> {
        let normalized = rewrite::normalize_environment_url(url)?;
        self.mutate(move |state| {
            state.active_environment_id = None;
            state.active_environment_url = Some(normalized.clone());
            Ok(normalized)
        })
        .await
    }

    pub async fn add_environment(
        &self,
        label: &str,
        url: &str,
    ) -> Result<EnvironmentRecord, StoreError> {
        let now = Utc::now();
        let record = EnvironmentRecord {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            url: rewrite::normalize_environment_url(url)?,
            created_at: now,
            updated_at: now,
        };
        self.mutate(move |state| {
            state.environments.push(record.clone());
            Ok(record)
        })
        .await
    }

    pub async fn update_environment(
        &self,
        id: &str,
        label: &str,
        url: &str,
    ) -> Result<EnvironmentRecord, StoreError> {
        let normalized = rewrite::normalize_environment_url(url)?;
        self.mutate(move |state| {
            let record = state
                .environments
                .iter_mut()
                .find(|record| record.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.label = label.to_string();
            record.url = normalized;
            record.updated_at = Utc::now();
            let updated = record.clone();
            if state.active_environment_id.as_deref() == Some(id) {
                state.active_environment_url = Some(updated.url.clone());
            }
            Ok(updated)
        })
        .await
    }

    pub async fn delete_environment(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            let before = state.environments.len();
            state.environments.retain(|record| record.id != id);
            if state.environments.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
            if state.active_environment_id.as_deref() == Some(id) {
                state.active_environment_id = None;
                state.active_environment_url = None;
            }
            Ok(())
        })
        .await
    }

    /// Apply a mutation to a cloned candidate state, persist it, then
    /// commit it to memory. A failed durable write leaves the in-memory
    /// state exactly as it was, so memory and disk never diverge. The
    /// writer lock gives mutations a total order over disk writes.
    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut PersistedState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.writer.lock().await;
        let mut next = self.state.read().unwrap().clone();
        let result = apply(&mut next)?;
        self.write_file(&next).await?;
        *self.state.write().unwrap() = next;
        Ok(result)
    }

    async fn write_file(&self, state: &PersistedState) -> Result<(), StoreError> {
        let persistence = |source: std::io::Error| StoreError::Persistence {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(persistence)?;
            }
        }
        let document = PersistedDocument {
            environments: &state.environments,
            active_environment_id: &state.active_environment_id,
            active_environment_url: &state.active_environment_url,
            targets: &state.environments,
            active_target_id: &state.active_environment_id,
            active_target_url: &state.active_environment_url,
        };
        let payload = serde_json::to_vec_pretty(&document)
            .map_err(|error| persistence(std::io::Error::other(error)))?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(persistence)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(persistence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> EnvironmentStore {
        EnvironmentStore::new(dir.path().join("targets.json"))
    }

    #[tokio::test]
    async fn init_creates_missing_file_with_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        assert!(dir.path().join("targets.json").exists());
        assert!(store.environments().is_empty());
        let selection = store.active_selection();
        assert_eq!(selection.url, None);
        assert_eq!(selection.environment_id, None);
    }

    #[tokio::test]
    async fn add_normalizes_url_and_returns_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let record = store
            .add_environment("staging", "http://localhost:4002/")
            .await
            .unwrap();
        assert_eq!(record.url, "http://localhost:4002");
        assert_eq!(record.label, "staging");
        assert_eq!(store.environments(), vec![record]);
    }

    #[tokio::test]
    async fn add_rejects_invalid_urls_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let error = store.add_environment("bad", "ftp://example.com").await;
        assert!(matches!(
            error,
            Err(StoreError::Validation(UrlError::UnsupportedScheme))
        ));
        assert!(store.environments().is_empty());
    }

    #[tokio::test]
    async fn switch_by_unknown_id_keeps_previous_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let record = store
            .add_environment("dev", "http://localhost:4000")
            .await
            .unwrap();
        store.set_active_environment_by_id(&record.id).await.unwrap();

        let error = store.set_active_environment_by_id("missing").await;
        assert!(matches!(error, Err(StoreError::NotFound(_))));
        let selection = store.active_selection();
        assert_eq!(selection.environment_id, Some(record.id));
        assert_eq!(selection.url, Some(record.url));
    }

    #[tokio::test]
    async fn ad_hoc_url_supersedes_saved_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let record = store
            .add_environment("dev", "http://localhost:4000")
            .await
            .unwrap();
        store.set_active_environment_by_id(&record.id).await.unwrap();

        let normalized = store
            .set_active_environment_url("http://localhost:5000/")
            .await
            .unwrap();
        assert_eq!(normalized, "http://localhost:5000");
        let selection = store.active_selection();
        assert_eq!(selection.environment_id, None);
        assert_eq!(selection.url, Some("http://localhost:5000".to_string()));
    }

    #[tokio::test]
    async fn updating_active_environment_refreshes_active_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let record = store
            .add_environment("dev", "http://localhost:4000")
            .await
            .unwrap();
        store.set_active_environment_by_id(&record.id).await.unwrap();

        let updated = store
            .update_environment(&record.id, "dev", "http://localhost:4001")
            .await
            .unwrap();
        assert_eq!(updated.url, "http://localhost:4001");
        assert_eq!(
            store.active_selection().url,
            Some("http://localhost:4001".to_string())
        );
        assert!(updated.updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn deleting_active_environment_clears_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.init().await.unwrap();

        let record = store
            .add_environment("dev", "http://localhost:4000")
            .await
            .unwrap();
        store.set_active_environment_by_id(&record.id).await.unwrap();
        store.delete_environment(&record.id).await.unwrap();

        let selection = store.active_selection();
        assert_eq!(selection.environment_id, None);
        assert_eq!(selection.url, None);
        assert!(store.environments().is_empty());
    }

    #[tokio::test]
    async fn legacy_documents_load_and_both_schemas_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(
            &path,
            r#"{
                "targets": [{
                    "id": "legacy-1",
                    "label": "old",
                    "url": "http://localhost:9000",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-01-01T00:00:00Z"
                }],
                "activeTargetId": "legacy-1",
                "activeTargetUrl": "http://localhost:9000"
            }"#,
        )
        .unwrap();

        let store = EnvironmentStore::new(&path);
        store.init().await.unwrap();
        assert_eq!(store.environments().len(), 1);
        assert_eq!(
            store.active_selection().environment_id,
            Some("legacy-1".to_string())
        );

        store
            .add_environment("new", "http://localhost:9001")
            .await
            .unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["environments"].as_array().unwrap().len(), 2);
        assert_eq!(written["environments"], written["targets"]);
        assert_eq!(written["activeEnvironmentId"], written["activeTargetId"]);
        assert_eq!(written["activeEnvironmentUrl"], written["activeTargetUrl"]);
    }

    #[tokio::test]
    async fn corrupt_file_reinitializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = EnvironmentStore::new(&path);
        store.init().await.unwrap();
        assert!(store.environments().is_empty());
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(written["environments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_mutations_never_corrupt_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));
        store.init().await.unwrap();

        let mut tasks = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .add_environment(
                        &format!("env-{index}"),
                        &format!("http://localhost:{}", 4000 + index),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("targets.json")).unwrap())
                .unwrap();
        assert_eq!(written["environments"].as_array().unwrap().len(), 8);
        assert_eq!(store.environments().len(), 8);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        let store = EnvironmentStore::new(&path);
        store.init().await.unwrap();
        store
            .add_environment("dev", "http://localhost:4000")
            .await
            .unwrap();

        // Replacing the state file with a directory makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let error = store.add_environment("other", "http://localhost:5000").await;
        assert!(matches!(error, Err(StoreError::Persistence { .. })));
        assert_eq!(store.environments().len(), 1);
        assert_eq!(store.environments()[0].label, "dev");
    }
}
