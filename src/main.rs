use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use appforge::config::AppConfig;
use appforge::core::llm::{ProviderKind, ProviderRegistry};
use appforge::core::pipeline::PipelineOrchestrator;
use appforge::core::sandbox::{Sandbox, SandboxRequest};
use appforge::core::vfs::VirtualFileSystem;
use appforge::storage::{ProviderConfigRecord, Storage};

const CONFIG_PATH: &str = "appforge.toml";
const DEFAULT_USER: &str = "local";

const USAGE: &str = "\
appforge — AI-assisted application builder

Usage:
  appforge build <project> <prompt...> [--user <id>] [--model <name>]
  appforge run <project> [--cmd <shell command>] [--user <id>]
  appforge files <project>
  appforge providers list [--user <id>]
  appforge providers add <kind> <name> <api-key> <model>
                         [--user <id>] [--base-url <url>] [--primary]
  appforge providers remove <id> [--user <id>]
  appforge providers check [--user <id>]
";

#[tokio::main]
async fn main() {
    appforge::logging::init();
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print!("{}", USAGE);
        return Ok(());
    };

    let config = AppConfig::load(CONFIG_PATH).await?;
    let storage = Arc::new(Storage::open(&config.storage.database_path).await?);
    let vfs = Arc::new(VirtualFileSystem::new(
        storage.clone(),
        config.storage.workspace_dir.clone(),
    ));
    let registry = Arc::new(ProviderRegistry::new(storage.clone()));

    match command.as_str() {
        "build" => cmd_build(storage, vfs, registry, &args[1..]).await,
        "run" => cmd_run(&config, vfs, &args[1..]).await,
        "files" => cmd_files(vfs, &args[1..]).await,
        "providers" => cmd_providers(storage, registry, &args[1..]).await,
        other => {
            print!("{}", USAGE);
            bail!("unknown command: {}", other)
        }
    }
}

async fn cmd_build(
    storage: Arc<Storage>,
    vfs: Arc<VirtualFileSystem>,
    registry: Arc<ProviderRegistry>,
    args: &[String],
) -> Result<()> {
    let (positional, flags) = split_flags(args);
    let [project, prompt @ ..] = positional.as_slice() else {
        bail!("usage: appforge build <project> <prompt...>");
    };
    if prompt.is_empty() {
        bail!("usage: appforge build <project> <prompt...>");
    }
    let prompt = prompt.join(" ");
    let user = flag(&flags, "--user").unwrap_or(DEFAULT_USER).to_string();
    let model = flag(&flags, "--model").map(str::to_string);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("{}", message);
        }
    });

    let orchestrator = PipelineOrchestrator::new(storage, vfs.clone(), registry);
    let outcome = orchestrator
        .execute_pipeline(project, &user, &prompt, model, Some(tx))
        .await;
    let _ = printer.await;

    match outcome {
        Ok(results) => {
            println!("{} stage(s) completed", results.len());
            let files = vfs.load_project(project).await?;
            let mut paths: Vec<&String> = files.keys().collect();
            paths.sort();
            for path in paths {
                println!("  {}", path);
            }
            Ok(())
        }
        Err(e) => Err(anyhow!("{}", e)),
    }
}

async fn cmd_run(config: &AppConfig, vfs: Arc<VirtualFileSystem>, args: &[String]) -> Result<()> {
    let (positional, flags) = split_flags(args);
    let [project] = positional.as_slice() else {
        bail!("usage: appforge run <project> [--cmd <shell command>]");
    };

    let files: HashMap<String, String> = vfs
        .load_project(project)
        .await?
        .into_iter()
        .map(|(path, file)| (path, file.content))
        .collect();
    if files.is_empty() {
        bail!("project {} has no files; run `appforge build` first", project);
    }

    let request = SandboxRequest {
        project_id: project.to_string(),
        files,
        command: flag(&flags, "--cmd").map(str::to_string),
        env: HashMap::new(),
    };
    let result = Sandbox::new(config.sandbox.clone()).execute(&request).await;

    for log in &result.logs {
        println!("[{}] {}", log.timestamp.format("%H:%M:%S"), log.message);
    }
    if !result.stdout.is_empty() {
        println!("{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr.trim_end());
    }
    if result.exit_code != 0 {
        bail!("command exited with code {}", result.exit_code);
    }
    Ok(())
}

async fn cmd_files(vfs: Arc<VirtualFileSystem>, args: &[String]) -> Result<()> {
    let (positional, _) = split_flags(args);
    let [project] = positional.as_slice() else {
        bail!("usage: appforge files <project>");
    };
    let files = vfs.load_project(project).await?;
    let mut entries: Vec<_> = files.values().collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    for file in entries {
        println!("v{:<4} {:>8}B  {}", file.version, file.content.len(), file.path);
    }
    Ok(())
}

async fn cmd_providers(
    storage: Arc<Storage>,
    registry: Arc<ProviderRegistry>,
    args: &[String],
) -> Result<()> {
    let (positional, flags) = split_flags(args);
    let user = flag(&flags, "--user").unwrap_or(DEFAULT_USER).to_string();

    match positional.as_slice() {
        [action] if action == "list" => {
            for config in storage.enabled_provider_configs(&user).await? {
                println!(
                    "{}  {:<8} {:<16} model={} {}",
                    config.id,
                    config.kind.as_str(),
                    config.name,
                    config.default_model,
                    if config.is_primary { "(primary)" } else { "" }
                );
            }
            Ok(())
        }
        [action, kind, name, api_key, model] if action == "add" => {
            let kind = ProviderKind::from_str(kind)
                .ok_or_else(|| anyhow!("unknown provider kind: {}", kind))?;
            let mut record =
                ProviderConfigRecord::new(user.as_str(), kind, name.as_str(), api_key.as_str(), model.as_str());
            record.base_url = flag(&flags, "--base-url").map(str::to_string);
            record.is_primary = flags.contains_key("--primary");
            storage.upsert_provider_config(&record).await?;
            registry.refresh_user_providers(&user).await?;
            println!("added provider {} ({})", record.name, record.id);
            Ok(())
        }
        [action, id] if action == "remove" => {
            storage.delete_provider_config(id).await?;
            registry.refresh_user_providers(&user).await?;
            println!("removed provider {}", id);
            Ok(())
        }
        [action] if action == "check" => {
            let available = registry.list_available(&user).await?;
            if available.is_empty() {
                println!("no providers reachable");
            } else {
                for name in available {
                    println!("{} is reachable", name);
                }
            }
            Ok(())
        }
        _ => bail!("usage: appforge providers <list|add|remove|check>"),
    }
}

/// Split argv into positional arguments and `--flag [value]` pairs. A flag
/// followed by another flag (or nothing) is treated as boolean.
fn split_flags(args: &[String]) -> (Vec<String>, HashMap<String, Option<String>>) {
    let mut positional = Vec::new();
    let mut flags = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        if args[i].starts_with("--") {
            let name = args[i].clone();
            let value = args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
            i += 1 + usize::from(value.is_some());
            flags.insert(name, value);
        } else {
            positional.push(args[i].clone());
            i += 1;
        }
    }
    (positional, flags)
}

fn flag<'a>(flags: &'a HashMap<String, Option<String>>, name: &str) -> Option<&'a str> {
    flags.get(name).and_then(|v| v.as_deref())
}
