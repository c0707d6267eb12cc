//! Isolated execution of untrusted commands against a generated file set.
//! Drives the Docker CLI: stage files, ensure the base image, create and
//! start a locked-down container (no network, fixed cpu/memory), wait for
//! exit, collect output, and tear everything down. This component never
//! returns an error; every failure becomes a result with exit code 1.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::core::{ExecutionLog, LogLevel};

/// Inputs for one sandbox run: file contents keyed by relative path, an
/// optional shell command, and extra environment variables.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub project_id: String,
    pub files: HashMap<String, String>,
    pub command: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub logs: Vec<ExecutionLog>,
}

pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Run a command against the staged file set. Always returns a result;
    /// the staging directory is removed and any created container is
    /// force-removed regardless of outcome.
    pub async fn execute(&self, request: &SandboxRequest) -> SandboxResult {
        let run_id = format!(
            "sandbox-{}-{}",
            request.project_id,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let staging = self.config.staging_root.join(&run_id);
        let mut logs = Vec::new();
        let mut created = false;

        let outcome = self
            .run(request, &run_id, &staging, &mut logs, &mut created)
            .await;

        // Staging teardown is unconditional.
        let _ = tokio::fs::remove_dir_all(&staging).await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                logs.push(ExecutionLog::error(format!("Sandbox error: {:#}", e)));
                if created {
                    // Best-effort cleanup; secondary failures are swallowed.
                    let _ = self.docker(&["rm", "-f", &run_id]).await;
                }
                SandboxResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("{:#}", e),
                    logs,
                }
            }
        }
    }

    async fn run(
        &self,
        request: &SandboxRequest,
        run_id: &str,
        staging: &Path,
        logs: &mut Vec<ExecutionLog>,
        created: &mut bool,
    ) -> Result<SandboxResult> {
        self.stage_files(staging, &request.files).await?;
        logs.push(ExecutionLog::info(format!(
            "Created {} files in {}",
            request.files.len(),
            staging.display()
        )));

        self.ensure_image().await?;

        self.create_container(request, run_id, staging).await?;
        *created = true;
        logs.push(ExecutionLog::info(format!("Container {} created", run_id)));

        self.docker_checked(&["start", run_id])
            .await
            .context("starting container")?;
        logs.push(ExecutionLog::success("Container started"));

        // Blocking wait for a terminal state. No timeout at this layer; the
        // caller imposes an overall deadline if it needs one.
        let wait = self
            .docker_checked(&["wait", run_id])
            .await
            .context("waiting for container")?;
        let exit_code: i64 = String::from_utf8_lossy(&wait.stdout)
            .trim()
            .parse()
            .unwrap_or(1);

        let output = self
            .docker_checked(&["logs", run_id])
            .await
            .context("collecting container output")?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let (stdout, stderr) = split_output(&combined);

        let _ = self.docker(&["rm", "-f", run_id]).await;

        logs.push(ExecutionLog::new(
            if exit_code == 0 {
                LogLevel::Success
            } else {
                LogLevel::Error
            },
            format!("Container exited with code {}", exit_code),
        ));

        Ok(SandboxResult {
            exit_code,
            stdout,
            stderr,
            logs: logs.clone(),
        })
    }

    /// Materialize the file set under a private staging directory, creating
    /// parent directories as needed.
    async fn stage_files(&self, staging: &Path, files: &HashMap<String, String>) -> Result<()> {
        tokio::fs::create_dir_all(staging)
            .await
            .context("creating staging directory")?;
        for (rel_path, content) in files {
            let full_path = staging.join(sanitize_rel_path(rel_path)?);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full_path, content).await?;
        }
        Ok(())
    }

    /// Acquire the base image, pulling it when absent. Pull failures are
    /// fatal for this invocation only.
    async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.image;
        let inspect = self.docker(&["image", "inspect", image]).await?;
        if inspect.status.success() {
            return Ok(());
        }
        info!("Pulling image {}...", image);
        self.docker_checked(&["pull", image])
            .await
            .with_context(|| format!("pulling image {}", image))?;
        Ok(())
    }

    async fn create_container(
        &self,
        request: &SandboxRequest,
        run_id: &str,
        staging: &Path,
    ) -> Result<()> {
        let memory = parse_memory_limit(&self.config.memory_limit);
        let cpus = self.config.cpus.to_string();
        let memory_arg = memory.to_string();
        let bind = format!("{}:/workspace", staging.display());

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            run_id.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            memory_arg,
            "--cpus".into(),
            cpus,
            "-v".into(),
            bind,
            "-w".into(),
            "/workspace".into(),
        ];
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.config.image.clone());
        args.push("/bin/sh".into());
        if let Some(command) = &request.command {
            args.push("-c".into());
            args.push(command.clone());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker_checked(&arg_refs)
            .await
            .context("creating container")?;
        Ok(())
    }

    async fn docker(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.config.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| anyhow!("failed to invoke {}: {}", self.config.docker_bin, e))
    }

    async fn docker_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output)
    }
}

/// Reject path components that would escape the staging directory.
fn sanitize_rel_path(rel_path: &str) -> Result<PathBuf> {
    let path = Path::new(rel_path);
    if path.is_absolute() {
        return Err(anyhow!("absolute path not allowed: {}", rel_path));
    }
    for component in path.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(anyhow!("parent traversal not allowed: {}", rel_path));
        }
    }
    Ok(path.to_path_buf())
}

/// Parse a docker-style memory limit ("512m", "1g", "1024k", plain bytes)
/// into bytes. Falls back to 512 MiB on malformed input.
fn parse_memory_limit(limit: &str) -> u64 {
    const FALLBACK: u64 = 512 * 1024 * 1024;
    let limit = limit.trim();
    let (digits, unit) = match limit.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => limit.split_at(i),
        None => (limit, ""),
    };
    let Ok(value) = digits.parse::<u64>() else {
        return FALLBACK;
    };
    match unit.to_ascii_lowercase().as_str() {
        "" => value,
        "k" => value * 1024,
        "m" => value * 1024 * 1024,
        "g" => value * 1024 * 1024 * 1024,
        _ => FALLBACK,
    }
}

/// Heuristic stream classification: combined output lines containing an
/// error-indicating token go to stderr, everything else to stdout. Known
/// imprecise; kept until separate stream descriptors are plumbed through.
fn split_output(output: &str) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for line in output.lines() {
        if line.contains("ERROR") || line.contains("Error") {
            stderr.push(line);
        } else {
            stdout.push(line);
        }
    }
    (stdout.join("\n"), stderr.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limits_parse_with_suffixes() {
        assert_eq!(parse_memory_limit("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64K"), 64 * 1024);
        assert_eq!(parse_memory_limit("1048576"), 1_048_576);
        assert_eq!(parse_memory_limit("banana"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512mb"), 512 * 1024 * 1024);
    }

    #[test]
    fn output_split_routes_error_lines_to_stderr() {
        let (out, err) = split_output("hello\nError: boom\nworld\nFATAL ERROR\n");
        assert_eq!(out, "hello\nworld");
        assert_eq!(err, "Error: boom\nFATAL ERROR");
    }

    #[test]
    fn rel_paths_cannot_escape_staging() {
        assert!(sanitize_rel_path("src/index.js").is_ok());
        assert!(sanitize_rel_path("../evil").is_err());
        assert!(sanitize_rel_path("/etc/passwd").is_err());
        assert!(sanitize_rel_path("a/../../b").is_err());
    }

    // Needs a running docker daemon: `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn successful_run_collects_output_and_cleans_staging() {
        let scratch = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            staging_root: scratch.path().to_path_buf(),
            ..Default::default()
        };
        let sandbox = Sandbox::new(config);
        let mut files = HashMap::new();
        files.insert("hello.txt".to_string(), "hello\n".to_string());
        let request = SandboxRequest {
            project_id: "p1".to_string(),
            files,
            command: Some("cat hello.txt".to_string()),
            env: HashMap::new(),
        };

        let result = sandbox.execute(&request).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failure_still_returns_result_and_cleans_staging() {
        let scratch = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            docker_bin: "definitely-not-a-docker-binary".to_string(),
            staging_root: scratch.path().to_path_buf(),
            ..Default::default()
        };
        let sandbox = Sandbox::new(config);
        let mut files = HashMap::new();
        files.insert("hello.txt".to_string(), "hi".to_string());
        let request = SandboxRequest {
            project_id: "p1".to_string(),
            files,
            command: Some("cat hello.txt".to_string()),
            env: HashMap::new(),
        };

        let result = sandbox.execute(&request).await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.is_empty());
        assert!(!result.stderr.is_empty());
        assert!(result
            .logs
            .iter()
            .any(|l| l.message.starts_with("Sandbox error:")));
        // Staging scratch location must be gone.
        let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
