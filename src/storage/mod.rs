//! Durable record store backing the provider registry, the virtual file
//! system and the pipeline's execution audit trail. One SQLite connection
//! shared behind an async mutex; all tables are created on open.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::llm::ProviderKind;
use crate::core::ExecutionLog;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// A user-owned LLM provider configuration row.
#[derive(Debug, Clone)]
pub struct ProviderConfigRecord {
    pub id: String,
    pub user_id: String,
    pub kind: ProviderKind,
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: String,
    pub enabled: bool,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl ProviderConfigRecord {
    /// A fresh enabled, non-primary config with default sampling parameters.
    pub fn new(
        user_id: impl Into<String>,
        kind: ProviderKind,
        name: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            kind,
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            default_model: default_model.into(),
            enabled: true,
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            is_primary: false,
            created_at: Utc::now(),
        }
    }
}

/// One physical, immutable file version row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub project_id: String,
    pub path: String,
    pub content: String,
    pub version: i64,
    pub diff: Option<String>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record of one agent invocation within a pipeline run.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub agent_type: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Value,
    pub logs: Vec<ExecutionLog>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<(), StorageError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS provider_configs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                api_key TEXT NOT NULL,
                base_url TEXT,
                default_model TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                temperature REAL NOT NULL DEFAULT 0.7,
                max_tokens INTEGER NOT NULL DEFAULT 2048,
                top_p REAL NOT NULL DEFAULT 1.0,
                is_primary INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                version INTEGER NOT NULL,
                diff TEXT,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (project_id, path, version)
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_files_project_version
             ON files (project_id, version DESC)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT 'null',
                logs TEXT NOT NULL DEFAULT '[]',
                started_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_project
             ON executions (project_id, started_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ── provider configs ──

    /// Insert or replace a provider configuration. When the incoming row is
    /// both enabled and primary, every other config of the same user loses
    /// its primary flag inside the same transaction, keeping at most one
    /// enabled primary per user.
    pub async fn upsert_provider_config(
        &self,
        config: &ProviderConfigRecord,
    ) -> Result<(), StorageError> {
        let config = clamp_parameters(config.clone());
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        if config.is_primary && config.enabled {
            tx.execute(
                "UPDATE provider_configs SET is_primary = 0 WHERE user_id = ?1 AND id != ?2",
                params![config.user_id, config.id],
            )?;
        }
        tx.execute(
            "INSERT INTO provider_configs
                (id, user_id, kind, name, api_key, base_url, default_model,
                 enabled, temperature, max_tokens, top_p, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                api_key = excluded.api_key,
                base_url = excluded.base_url,
                default_model = excluded.default_model,
                enabled = excluded.enabled,
                temperature = excluded.temperature,
                max_tokens = excluded.max_tokens,
                top_p = excluded.top_p,
                is_primary = excluded.is_primary",
            params![
                config.id,
                config.user_id,
                config.kind.as_str(),
                config.name,
                config.api_key,
                config.base_url,
                config.default_model,
                config.enabled,
                config.temperature,
                config.max_tokens,
                config.top_p,
                config.is_primary,
                config.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn delete_provider_config(&self, id: &str) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let n = db.execute("DELETE FROM provider_configs WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("provider config {}", id)));
        }
        Ok(())
    }

    /// All enabled configs for a user, in stable creation order.
    pub async fn enabled_provider_configs(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProviderConfigRecord>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, user_id, kind, name, api_key, base_url, default_model,
                    enabled, temperature, max_tokens, top_p, is_primary, created_at
             FROM provider_configs
             WHERE user_id = ?1 AND enabled = 1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_provider_config)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── file versions ──

    /// Append one immutable physical file row. Version numbering is the
    /// virtual file system's responsibility; duplicates are rejected by the
    /// unique (project, path, version) constraint.
    pub async fn append_file_version(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        version: i64,
        diff: Option<&str>,
    ) -> Result<FileRecord, StorageError> {
        let now = Utc::now();
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            version,
            diff: diff.map(str::to_string),
            size: content.len() as i64,
            created_at: now,
            updated_at: now,
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO files (id, project_id, path, content, version, diff, size, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.project_id,
                record.path,
                record.content,
                record.version,
                record.diff,
                record.size,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(record)
    }

    /// Every physical row of a project, highest versions first. The caller
    /// keeps the first row it sees per path to materialize the latest view.
    pub async fn project_file_versions(
        &self,
        project_id: &str,
    ) -> Result<Vec<FileRecord>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, project_id, path, content, version, diff, size, created_at, updated_at
             FROM files WHERE project_id = ?1 ORDER BY version DESC",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_file_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Full version history for one path, descending. Retained across soft
    /// deletes from the materialized view.
    pub async fn file_history(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<FileRecord>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, project_id, path, content, version, diff, size, created_at, updated_at
             FROM files WHERE project_id = ?1 AND path = ?2 ORDER BY version DESC",
        )?;
        let rows = stmt.query_map(params![project_id, path], row_to_file_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── executions ──

    /// Create an execution record in `running` state. One record per agent
    /// invocation; never reused.
    pub async fn create_execution(
        &self,
        project_id: &str,
        user_id: &str,
        agent_type: &str,
        input: &Value,
    ) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO executions (id, project_id, user_id, agent_type, status, input, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                project_id,
                user_id,
                agent_type,
                ExecutionStatus::Running.as_str(),
                serde_json::to_string(input)?,
                Utc::now(),
            ],
        )?;
        Ok(id)
    }

    /// Transition an execution to its terminal state with output and logs.
    pub async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: &Value,
        logs: &[ExecutionLog],
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE executions SET status = ?2, output = ?3, logs = ?4, completed_at = ?5
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                serde_json::to_string(output)?,
                serde_json::to_string(logs)?,
                Utc::now(),
            ],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    /// Read-only audit view of a project's executions, newest first.
    pub async fn project_executions(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, project_id, user_id, agent_type, status, input, output, logs,
                    started_at, completed_at
             FROM executions WHERE project_id = ?1 ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_execution_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn clamp_parameters(mut config: ProviderConfigRecord) -> ProviderConfigRecord {
    config.temperature = config.temperature.clamp(0.0, 2.0);
    config.max_tokens = config.max_tokens.clamp(1, 32_000);
    config.top_p = config.top_p.clamp(0.0, 1.0);
    config
}

fn row_to_provider_config(row: &Row) -> rusqlite::Result<ProviderConfigRecord> {
    let kind: String = row.get(2)?;
    Ok(ProviderConfigRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: ProviderKind::from_str(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown provider kind {}", kind).into(),
            )
        })?,
        name: row.get(3)?,
        api_key: row.get(4)?,
        base_url: row.get(5)?,
        default_model: row.get(6)?,
        enabled: row.get(7)?,
        temperature: row.get(8)?,
        max_tokens: row.get(9)?,
        top_p: row.get(10)?,
        is_primary: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn row_to_file_record(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        path: row.get(2)?,
        content: row.get(3)?,
        version: row.get(4)?,
        diff: row.get(5)?,
        size: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_execution_record(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(4)?;
    let input: String = row.get(5)?;
    let output: String = row.get(6)?;
    let logs: String = row.get(7)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        agent_type: row.get(3)?,
        status: ExecutionStatus::from_status(&status).unwrap_or(ExecutionStatus::Failed),
        input: serde_json::from_str(&input).unwrap_or(Value::Null),
        output: serde_json::from_str(&output).unwrap_or(Value::Null),
        logs: serde_json::from_str(&logs).unwrap_or_default(),
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}
