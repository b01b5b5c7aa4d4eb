//! `execCommands`: run shell commands on the host for the page

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Options accepted after the command list
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// One command or a list of commands, as the page may send either
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandList {
    One(String),
    Many(Vec<String>),
}

impl CommandList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(command) => vec![command],
            Self::Many(commands) => commands,
        }
    }
}

/// Run `commands` one after another, stopping at the first failure
///
/// Resolves with the stdout of the last command, or `null` for an empty list.
pub async fn exec_commands(
    commands: CommandList,
    options: ExecOptions,
    config: Arc<BridgeConfig>,
) -> BridgeResult<Value> {
    let mut output = Value::Null;
    for command in commands.into_vec() {
        let options = options.clone();
        let config = Arc::clone(&config);
        let stdout = blocking::unblock(move || exec_command(&command, &options, &config)).await?;
        output = Value::String(stdout);
    }
    Ok(output)
}

fn exec_command(command: &str, options: &ExecOptions, config: &BridgeConfig) -> BridgeResult<String> {
    let (shell, shell_args) = config
        .shell()
        .split_first()
        .ok_or_else(|| BridgeError::ConfigError("shell must not be empty".to_string()))?;

    tracing::debug!(command = %command, "executing host command");

    let mut process = Command::new(shell);
    process
        .args(shell_args)
        .arg(command)
        .envs(config.envs().iter().map(|(k, v)| (k, v)))
        .envs(&options.env)
        .stdin(Stdio::null());
    if !config.path_prepend().is_empty() {
        process.env("PATH", prepend_path(std::env::var_os("PATH"), config.path_prepend())?);
    }
    if let Some(cwd) = &options.cwd {
        process.current_dir(cwd);
    }

    let output = process.output()?;
    if !output.status.success() {
        return Err(BridgeError::CommandFailed {
            code: output.status.code().unwrap_or(-1),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Put `dirs` in front of `current`, skipping any already present
pub(crate) fn prepend_path(current: Option<OsString>, dirs: &[PathBuf]) -> BridgeResult<OsString> {
    let existing: Vec<PathBuf> = current
        .as_deref()
        .map(|path| std::env::split_paths(path).collect())
        .unwrap_or_default();

    let mut merged: Vec<PathBuf> = dirs
        .iter()
        .filter(|dir| !existing.contains(dir))
        .cloned()
        .collect();
    merged.extend(existing);

    std::env::join_paths(merged).map_err(|e| BridgeError::ConfigError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_command_list_accepts_string_or_array() {
        let one: CommandList = serde_json::from_value(json!("ls")).unwrap();
        let many: CommandList = serde_json::from_value(json!(["a", "b"])).unwrap();

        assert_eq!(one.into_vec(), vec!["ls".to_string()]);
        assert_eq!(many.into_vec(), vec!["a".to_string(), "b".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_prepend_path_skips_present_dirs() {
        let current = Some(OsString::from("/usr/bin:/bin"));
        let dirs = [PathBuf::from("/opt/tools/bin"), PathBuf::from("/bin")];

        let path = prepend_path(current, &dirs).unwrap();
        assert_eq!(path, OsString::from("/opt/tools/bin:/usr/bin:/bin"));
    }

    #[cfg(unix)]
    #[test]
    fn test_prepend_path_without_existing_path() {
        let path = prepend_path(None, &[PathBuf::from("/opt/bin")]).unwrap();
        assert_eq!(path, OsString::from("/opt/bin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_returns_last_output() {
        let config = Arc::new(BridgeConfig::builder().env("GREETING", "hello").build().unwrap());
        let commands = CommandList::Many(vec!["echo first".to_string(), "echo $GREETING".to_string()]);

        let output = exec_commands(commands, ExecOptions::default(), config).await.unwrap();
        assert_eq!(output, json!("hello\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let config = Arc::new(BridgeConfig::builder().build().unwrap());
        let commands = CommandList::Many(vec![
            "echo broken >&2; exit 4".to_string(),
            format!("touch {}", marker.display()),
        ]);

        let result = exec_commands(commands, ExecOptions::default(), config).await;
        match result {
            Err(BridgeError::CommandFailed { code, message }) => {
                assert_eq!(code, 4);
                assert_eq!(message, "broken");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_uses_cwd_and_env_options() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(BridgeConfig::builder().build().unwrap());
        let options = ExecOptions {
            cwd: Some(dir.path().to_path_buf()),
            env: HashMap::from([("NAME".to_string(), "ferry".to_string())]),
        };

        let output = exec_commands(CommandList::One("echo $NAME > out.txt".to_string()), options, config)
            .await
            .unwrap();

        assert_eq!(output, json!(""));
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, "ferry\n");
    }

    #[tokio::test]
    async fn test_empty_list_resolves_null() {
        let config = Arc::new(BridgeConfig::builder().build().unwrap());

        let output = exec_commands(CommandList::Many(Vec::new()), ExecOptions::default(), config)
            .await
            .unwrap();
        assert_eq!(output, Value::Null);
    }
}
