use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Process-wide configuration. Loaded from an optional `appforge.toml` next
/// to the working directory, with environment overrides for deploy-time
/// values. Every field has a usable default so a bare checkout runs.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file holding provider configs, file versions and
    /// execution records.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// When set, every virtual-file write is mirrored to
    /// `<workspace_dir>/<project>/<path>` so external tooling and the
    /// sandbox can consume real files.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Base runtime image for sandbox runs.
    #[serde(default = "default_image")]
    pub image: String,

    /// CPU share granted to a run, in whole cores.
    #[serde(default = "default_cpus")]
    pub cpus: u32,

    /// Memory ceiling, docker-style suffix string ("512m", "1g").
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// Docker binary to invoke.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Scratch root for staging directories.
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("appforge.db")
}
fn default_image() -> String {
    "node:18-alpine".to_string()
}
fn default_cpus() -> u32 {
    1
}
fn default_memory_limit() -> String {
    "512m".to_string()
}
fn default_docker_bin() -> String {
    "docker".to_string()
}
fn default_staging_root() -> PathBuf {
    std::env::temp_dir()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workspace_dir: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpus: default_cpus(),
            memory_limit: default_memory_limit(),
            docker_bin: default_docker_bin(),
            staging_root: default_staging_root(),
        }
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(config_path).await?;
            toml::from_str(&content)?
        } else {
            info!("No {} found, using defaults.", config_path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APPFORGE_DB") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("APPFORGE_WORKSPACE") {
            self.storage.workspace_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_MEMORY_LIMIT") {
            self.sandbox.memory_limit = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_CPU_LIMIT") {
            if let Ok(n) = v.parse() {
                self.sandbox.cpus = n;
            }
        }
    }
}
