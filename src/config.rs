use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::ipc::protocol::DEFAULT_MAX_FRAME_LEN;

/// Configuration for the privileged side of the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    worker_program: String,
    worker_args: Vec<String>,
    worker_dir: PathBuf,
    worker_extension: String,
    envs: Vec<(String, String)>,
    path_prepend: Vec<PathBuf>,
    shell: Vec<String>,
    fetch_timeout: Duration,
    fetch_system_proxy: bool,
    max_frame_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_program: "node".to_string(),
            worker_args: Vec::new(),
            worker_dir: std::env::temp_dir(),
            worker_extension: "js".to_string(),
            envs: Vec::new(),
            path_prepend: Vec::new(),
            shell: default_shell(),
            fetch_timeout: Duration::from_secs(30),
            fetch_system_proxy: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

fn default_shell() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string()]
    } else {
        vec!["sh".to_string(), "-c".to_string()]
    }
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Interpreter that runs worker sources
    pub fn worker_program(&self) -> &str {
        &self.worker_program
    }

    /// Arguments placed before the worker script path
    pub fn worker_args(&self) -> &[String] {
        &self.worker_args
    }

    /// Directory where inline (data URL) worker sources are written
    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    pub fn worker_extension(&self) -> &str {
        &self.worker_extension
    }

    /// Extra environment for workers and executed commands
    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Directories prepended to `PATH` for workers and executed commands
    pub fn path_prepend(&self) -> &[PathBuf] {
        &self.path_prepend
    }

    /// Shell invocation for `execCommands`, e.g. `["sh", "-c"]`
    pub fn shell(&self) -> &[String] {
        &self.shell
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub fn fetch_system_proxy(&self) -> bool {
        self.fetch_system_proxy
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    inner: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn worker_program(mut self, program: impl Into<String>) -> Self {
        self.inner.worker_program = program.into();
        self
    }

    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.inner.worker_args.push(arg.into());
        self
    }

    pub fn worker_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner.worker_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn worker_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.worker_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn worker_extension(mut self, extension: impl Into<String>) -> Self {
        self.inner.worker_extension = extension.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.inner.envs.push((key.into(), val.into()));
        self
    }

    pub fn envs(
        mut self,
        envs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.inner
            .envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn path_prepend(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.path_prepend.push(dir.as_ref().to_path_buf());
        self
    }

    pub fn shell(mut self, shell: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner.shell = shell.into_iter().map(Into::into).collect();
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.inner.fetch_timeout = timeout;
        self
    }

    /// Honor `HTTP_PROXY`/`HTTPS_PROXY` for proxied fetches (default: true)
    pub fn fetch_system_proxy(mut self, enabled: bool) -> Self {
        self.inner.fetch_system_proxy = enabled;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.inner.max_frame_len = len;
        self
    }

    pub fn build(self) -> BridgeResult<BridgeConfig> {
        let config = self.inner;

        if config.worker_program.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "worker program must not be empty".to_string(),
            ));
        }
        if config.shell.is_empty() {
            return Err(BridgeError::ConfigError("shell must not be empty".to_string()));
        }
        if config.max_frame_len == 0 || config.max_frame_len > u32::MAX as usize {
            return Err(BridgeError::ConfigError(format!(
                "max frame length out of range: {}",
                config.max_frame_len
            )));
        }
        if config.worker_extension.contains(['/', '\\']) {
            return Err(BridgeError::ConfigError(format!(
                "invalid worker extension: {}",
                config.worker_extension
            )));
        }

        Ok(config)
    }
}
