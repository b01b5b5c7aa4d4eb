use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use ferry::BridgeConfig;

use crate::cli::CommonArgs;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Worker interpreter settings
    pub worker: WorkerSection,

    /// Command execution settings
    pub exec: ExecSection,

    /// Fetch proxy settings
    pub fetch: FetchSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub dir: Option<PathBuf>,
    pub extension: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecSection {
    pub shell: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub path: Option<Vec<PathBuf>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: Option<u64>,
    pub system_proxy: Option<bool>,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &CommonArgs) -> Result<BridgeConfig> {
    let mut builder = BridgeConfig::builder();

    // Worker program: CLI > file > default
    if let Some(program) = cli.worker_program.clone().or(file.worker.program) {
        builder = builder.worker_program(program);
    }

    // Interpreter args: file first, then CLI
    let mut worker_args = file.worker.args.unwrap_or_default();
    worker_args.extend(cli.worker_args.iter().cloned());
    builder = builder.worker_args(worker_args);

    if let Some(dir) = cli.worker_dir.clone().or(file.worker.dir) {
        builder = builder.worker_dir(dir);
    }
    if let Some(extension) = file.worker.extension {
        builder = builder.worker_extension(extension);
    }

    if let Some(shell) = file.exec.shell {
        builder = builder.shell(shell);
    }

    // Environment: file, then CLI overrides
    let mut env_set = file.exec.env.unwrap_or_default();
    for env_str in &cli.envs {
        if let Some((key, value)) = env_str.split_once('=') {
            env_set.insert(key.to_string(), value.to_string());
        } else {
            anyhow::bail!("invalid env format (expected KEY=VALUE): {}", env_str);
        }
    }
    let mut envs: Vec<(String, String)> = env_set.into_iter().collect();
    envs.sort();
    builder = builder.envs(envs);

    // PATH additions: CLI first so they win the lookup
    let mut path_prepend = cli.path_prepend.clone();
    path_prepend.extend(file.exec.path.unwrap_or_default());
    for dir in path_prepend {
        builder = builder.path_prepend(dir);
    }

    if let Some(secs) = cli.fetch_timeout.or(file.fetch.timeout_secs) {
        builder = builder.fetch_timeout(Duration::from_secs(secs));
    }
    let system_proxy = !cli.no_system_proxy && file.fetch.system_proxy.unwrap_or(true);
    builder = builder.fetch_system_proxy(system_proxy);

    builder.build().context("invalid bridge configuration")
}
