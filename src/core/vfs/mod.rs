//! Versioned virtual file system. Every write appends an immutable physical
//! record; the "current" state of a project is the highest version per path,
//! materialized into a per-project in-memory cache. Deletes are soft: they
//! drop the path from the materialized view while history stays queryable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::storage::{FileRecord, Storage, StorageError};

/// Logical latest state of one path within one project.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualFile {
    pub id: String,
    pub project_id: String,
    pub path: String,
    pub content: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FileRecord> for VirtualFile {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            project_id: record.project_id,
            path: record.path,
            content: record.content,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

struct ProjectCache {
    loaded: bool,
    files: HashMap<String, VirtualFile>,
}

pub struct VirtualFileSystem {
    storage: Arc<Storage>,
    /// One cache slot per project. The outer lock only guards the handle
    /// map; load-then-mutate sequences hold the inner per-project lock, so
    /// writers to the same project serialize while projects stay independent.
    projects: Mutex<HashMap<String, Arc<Mutex<ProjectCache>>>>,
    /// Optional mirror of current file contents on disk for tooling and
    /// sandbox runs.
    workspace_dir: Option<PathBuf>,
}

impl VirtualFileSystem {
    pub fn new(storage: Arc<Storage>, workspace_dir: Option<PathBuf>) -> Self {
        Self {
            storage,
            projects: Mutex::new(HashMap::new()),
            workspace_dir,
        }
    }

    /// Materialized latest-version view of a project, as a copy-on-read
    /// snapshot. The first call per project scans the physical log; later
    /// calls serve from cache until `clear_cache`.
    pub async fn load_project(
        &self,
        project_id: &str,
    ) -> Result<HashMap<String, VirtualFile>, StorageError> {
        let handle = self.project_handle(project_id).await;
        let mut cache = handle.lock().await;
        self.ensure_loaded(project_id, &mut cache).await?;
        Ok(cache.files.clone())
    }

    /// Append the first version of a path. Returns the new virtual file.
    pub async fn create_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
    ) -> Result<VirtualFile, StorageError> {
        let handle = self.project_handle(project_id).await;
        let mut cache = handle.lock().await;
        self.ensure_loaded(project_id, &mut cache).await?;
        self.append(project_id, path, content, 1, None, &mut cache)
            .await
    }

    /// Append a new version of a path, or create it at version 1 when the
    /// path has no current entry. `diff` is stored as supplementary metadata
    /// only; full content is always persisted.
    pub async fn update_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        diff: Option<&str>,
    ) -> Result<VirtualFile, StorageError> {
        let handle = self.project_handle(project_id).await;
        let mut cache = handle.lock().await;
        self.ensure_loaded(project_id, &mut cache).await?;
        let version = match cache.files.get(path) {
            Some(existing) => existing.version + 1,
            None => 1,
        };
        self.append(project_id, path, content, version, diff, &mut cache)
            .await
    }

    /// Remove a path from the materialized view. The physical version log
    /// is retained for history queries.
    pub async fn delete_file(&self, project_id: &str, path: &str) -> Result<(), StorageError> {
        let handle = self.project_handle(project_id).await;
        let mut cache = handle.lock().await;
        self.ensure_loaded(project_id, &mut cache).await?;
        cache.files.remove(path);
        Ok(())
    }

    pub async fn get_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Option<VirtualFile>, StorageError> {
        let handle = self.project_handle(project_id).await;
        let mut cache = handle.lock().await;
        self.ensure_loaded(project_id, &mut cache).await?;
        Ok(cache.files.get(path).cloned())
    }

    pub async fn list_files(&self, project_id: &str) -> Result<Vec<VirtualFile>, StorageError> {
        let snapshot = self.load_project(project_id).await?;
        Ok(snapshot.into_values().collect())
    }

    /// Full append-only history of one path, highest version first,
    /// independent of the live cache (soft-deleted paths included).
    pub async fn get_file_history(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<VirtualFile>, StorageError> {
        let records = self.storage.file_history(project_id, path).await?;
        Ok(records.into_iter().map(VirtualFile::from).collect())
    }

    /// Evict one or all project caches. The next `load_project` rebuilds
    /// from durable storage. Consistency recovery, not a normal write path.
    pub async fn clear_cache(&self, project_id: Option<&str>) {
        let mut projects = self.projects.lock().await;
        match project_id {
            Some(id) => {
                projects.remove(id);
            }
            None => projects.clear(),
        }
    }

    async fn project_handle(&self, project_id: &str) -> Arc<Mutex<ProjectCache>> {
        let mut projects = self.projects.lock().await;
        projects
            .entry(project_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProjectCache {
                    loaded: false,
                    files: HashMap::new(),
                }))
            })
            .clone()
    }

    async fn ensure_loaded(
        &self,
        project_id: &str,
        cache: &mut ProjectCache,
    ) -> Result<(), StorageError> {
        if cache.loaded {
            return Ok(());
        }
        // Physical rows arrive highest-version first; the first row seen per
        // path is the current one.
        let records = self.storage.project_file_versions(project_id).await?;
        let mut files = HashMap::new();
        for record in records {
            files
                .entry(record.path.clone())
                .or_insert_with(|| VirtualFile::from(record));
        }
        debug!(
            "materialized {} file(s) for project {}",
            files.len(),
            project_id
        );
        cache.files = files;
        cache.loaded = true;
        Ok(())
    }

    /// Durable append, then cache mutation, then best-effort mirror. The
    /// cache never reflects a version that has not already been persisted.
    async fn append(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        version: i64,
        diff: Option<&str>,
        cache: &mut ProjectCache,
    ) -> Result<VirtualFile, StorageError> {
        let record = self
            .storage
            .append_file_version(project_id, path, content, version, diff)
            .await?;
        let file = VirtualFile::from(record);
        cache.files.insert(path.to_string(), file.clone());
        self.mirror(project_id, path, content).await;
        Ok(file)
    }

    async fn mirror(&self, project_id: &str, path: &str, content: &str) {
        let Some(workspace) = &self.workspace_dir else {
            return;
        };
        let full_path = workspace.join(project_id).join(path);
        if let Some(parent) = full_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("workspace mirror mkdir failed for {:?}: {}", parent, e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&full_path, content).await {
            warn!("workspace mirror write failed for {:?}: {}", full_path, e);
        }
    }
}
