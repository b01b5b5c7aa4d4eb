//! Workers backed by an interpreter child process
//!
//! The worker program talks JSON lines: every posted message is written to its
//! stdin as one line, every line it prints on stdout is a `message` event.
//! Lines on stderr become `error` events and process exit an `exit` event
//! carrying the exit code.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use serde_json::Value;
use smol::channel::{Receiver, Sender, unbounded};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::host::exec::prepend_path;
use crate::host::worker::{Listener, Listeners, Worker, WorkerFactory};
use crate::sync::lock;

/// Constructor options understood by process workers
///
/// Unknown fields (such as `type`) are accepted and ignored.
#[derive(Debug, Default)]
struct ProcessOptions {
    /// Extra arguments placed after the script path
    argv: Vec<String>,
    /// Extra environment for this worker
    env: Vec<(String, String)>,
    /// Working directory for the worker process
    cwd: Option<PathBuf>,
}

impl ProcessOptions {
    fn from_value(options: &Value) -> BridgeResult<Self> {
        match options {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => {
                let mut parsed = Self::default();
                if let Some(argv) = map.get("argv") {
                    parsed.argv = serde_json::from_value(argv.clone()).map_err(invalid_options)?;
                }
                if let Some(Value::Object(env)) = map.get("env") {
                    for (key, value) in env {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        parsed.env.push((key.clone(), value));
                    }
                }
                if let Some(cwd) = map.get("cwd") {
                    parsed.cwd = serde_json::from_value(cwd.clone()).map_err(invalid_options)?;
                }
                Ok(parsed)
            }
            other => Err(BridgeError::WorkerCreation(format!(
                "worker options must be an object, got {other}"
            ))),
        }
    }
}

fn invalid_options(e: serde_json::Error) -> BridgeError {
    BridgeError::WorkerCreation(format!("invalid worker options: {e}"))
}

/// Script on disk that a worker process runs
#[derive(Debug)]
struct ScriptFile {
    path: PathBuf,
    temporary: bool,
}

impl ScriptFile {
    /// Resolve a worker URL to a runnable file
    ///
    /// Inline `data:` sources are written into `dir`; `file://` URLs and plain
    /// paths are used in place. Remote sources are refused.
    fn resolve(url: &str, dir: &Path, extension: &str) -> BridgeResult<Self> {
        if let Some(rest) = url.strip_prefix("data:") {
            let (meta, payload) = rest
                .split_once(',')
                .ok_or_else(|| BridgeError::WorkerCreation("malformed data URL".to_string()))?;
            let code = if meta.ends_with(";base64") {
                STANDARD
                    .decode(payload.trim())
                    .map_err(|e| BridgeError::WorkerCreation(format!("invalid base64 source: {e}")))?
            } else {
                payload.as_bytes().to_vec()
            };

            std::fs::create_dir_all(dir)?;
            let name: u64 = rand::thread_rng().r#gen();
            let path = dir.join(format!("ferry-worker-{name:016x}.{extension}"));
            std::fs::write(&path, code)?;
            return Ok(Self {
                path,
                temporary: true,
            });
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            return Err(BridgeError::WorkerCreation(format!(
                "remote worker sources are not supported: {url}"
            )));
        }

        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        if !path.is_file() {
            return Err(BridgeError::WorkerCreation(format!(
                "worker script not found: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            temporary: false,
        })
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove worker script");
            }
        }
    }
}

/// Spawns a [`ProcessWorker`] per `create` request
pub struct ProcessWorkerFactory {
    config: Arc<BridgeConfig>,
}

impl ProcessWorkerFactory {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self { config }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn spawn(&self, url: &str, options: &Value) -> BridgeResult<Arc<dyn Worker>> {
        let options = ProcessOptions::from_value(options)?;
        let script = ScriptFile::resolve(
            url,
            self.config.worker_dir(),
            self.config.worker_extension(),
        )?;

        let program = self.config.worker_program();
        let mut command = Command::new(program);
        command
            .args(self.config.worker_args())
            .arg(&script.path)
            .args(&options.argv)
            .envs(self.config.envs().iter().map(|(k, v)| (k, v)))
            .envs(options.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.config.path_prepend().is_empty() {
            let path = prepend_path(std::env::var_os("PATH"), self.config.path_prepend())?;
            command.env("PATH", path);
        }
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| BridgeError::WorkerCreation(format!("failed to start {program}: {e}")))?;

        let worker = ProcessWorker::start(child, script);
        tracing::debug!(pid = worker.pid, program = %program, "started worker process");
        Ok(worker)
    }
}

/// First and last delay between exit checks once stdout has closed
const EXIT_POLL_START: Duration = Duration::from_millis(10);
const EXIT_POLL_MAX: Duration = Duration::from_secs(1);

/// A worker running as a child process
///
/// Messages are queued to a writer thread, so a worker that stops reading its
/// stdin never blocks the caller or `terminate`.
pub struct ProcessWorker {
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
    outbox: Mutex<Option<Sender<Vec<u8>>>>,
    stopped: Arc<StopSignal>,
    listeners: Arc<Listeners>,
    terminated: AtomicBool,
    _script: ScriptFile,
}

impl ProcessWorker {
    fn start(mut child: Child, script: ScriptFile) -> Arc<Self> {
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(Some(child)));
        let listeners = Arc::new(Listeners::new());
        let stopped = Arc::new(StopSignal::default());

        let (outbox_tx, outbox_rx) = unbounded();
        if let Some(stdin) = stdin {
            thread::spawn(move || write_lines(pid, stdin, outbox_rx));
        }

        if let Some(stdout) = stdout {
            let listeners = Arc::clone(&listeners);
            let child = Arc::clone(&child);
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let data = serde_json::from_str(&line).unwrap_or(Value::String(line));
                    listeners.emit("message", data);
                }

                // stdout closed: the process is exiting or about to be killed
                if let Some(code) = wait_for_exit(&child, &stopped) {
                    tracing::debug!(pid, code, "worker process exited");
                    listeners.emit("exit", code.map_or(Value::Null, Value::from));
                }
            });
        }

        if let Some(stderr) = stderr {
            let listeners = Arc::clone(&listeners);
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    listeners.emit("error", Value::String(line));
                }
            });
        }

        Arc::new(Self {
            pid,
            child,
            outbox: Mutex::new(Some(outbox_tx)),
            stopped,
            listeners,
            terminated: AtomicBool::new(false),
            _script: script,
        })
    }
}

/// Feed queued lines to the child's stdin until the queue closes or the pipe breaks
fn write_lines(pid: u32, mut stdin: ChildStdin, lines: Receiver<Vec<u8>>) {
    while let Ok(line) = lines.recv_blocking() {
        if let Err(e) = stdin.write_all(&line).and_then(|()| stdin.flush()) {
            tracing::debug!(pid, error = %e, "worker stopped reading its input");
            break;
        }
    }
}

/// Set once by `terminate`, waking the exit watcher
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *lock(&self.stopped) = true;
        self.wake.notify_all();
    }

    /// Sleep for at most `timeout`; true once the worker has been terminated
    fn wait(&self, timeout: Duration) -> bool {
        let stopped = lock(&self.stopped);
        if *stopped {
            return true;
        }
        let (stopped, _) = self
            .wake
            .wait_timeout(stopped, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// Exit code of a process that exited on its own
///
/// `None` when the worker was terminated instead; `terminate` reaps the child
/// itself. The child lock is only held for each `try_wait`.
fn wait_for_exit(child: &Mutex<Option<Child>>, stopped: &StopSignal) -> Option<Option<i32>> {
    let mut delay = EXIT_POLL_START;
    loop {
        match lock(child).as_mut().map(Child::try_wait) {
            None => return None,
            Some(Err(_)) => return Some(None),
            Some(Ok(Some(status))) => return Some(status.code()),
            Some(Ok(None)) => {}
        }
        if stopped.wait(delay) {
            return None;
        }
        delay = (delay * 2).min(EXIT_POLL_MAX);
    }
}

impl Worker for ProcessWorker {
    fn post_message(&self, message: Value) -> BridgeResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let outbox = lock(&self.outbox);
        let Some(outbox) = outbox.as_ref() else {
            return Ok(());
        };
        outbox
            .try_send(line)
            .map_err(|_| BridgeError::Worker(format!("worker {} stopped reading its input", self.pid)))
    }

    fn add_event_listener(&self, event: &str, listener: Arc<dyn Listener>) {
        if !self.terminated.load(Ordering::SeqCst) {
            self.listeners.add(event, listener);
        }
    }

    fn remove_event_listener(&self, event: &str, listener: &Arc<dyn Listener>) {
        self.listeners.remove(event, listener);
    }

    fn terminate(&self) -> BridgeResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = lock(&self.child).take();
        self.stopped.stop();

        // Kill before closing the queue: a write stuck on a full pipe only
        // returns once the reader is gone.
        if let Some(child) = child.as_mut() {
            tracing::debug!(pid = self.pid, "killing worker process");
            if let Err(e) = child.kill() {
                tracing::debug!(pid = self.pid, error = %e, "worker process already gone");
            }
        }
        if let Some(outbox) = lock(&self.outbox).take() {
            outbox.close();
        }
        self.listeners.clear();

        if let Some(mut child) = child {
            child.wait()?;
        }
        Ok(())
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            tracing::warn!(pid = self.pid, error = %e, "failed to stop worker process");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use serde_json::json;

    use super::*;
    use crate::host::worker::WorkerSource;

    struct ChannelListener(Mutex<mpsc::Sender<Value>>);

    impl Listener for ChannelListener {
        fn call(&self, args: Vec<Value>) {
            let _ = lock(&self.0).send(args.into_iter().next().unwrap_or(Value::Null));
        }
    }

    fn listener() -> (Arc<dyn Listener>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelListener(Mutex::new(tx))), rx)
    }

    fn sh_factory(dir: &Path) -> ProcessWorkerFactory {
        let config = BridgeConfig::builder()
            .worker_program("sh")
            .worker_extension("sh")
            .worker_dir(dir)
            .build()
            .unwrap();
        ProcessWorkerFactory::new(Arc::new(config))
    }

    #[test]
    fn test_options_parsing() {
        let options = ProcessOptions::from_value(&json!({
            "type": "commonjs",
            "argv": ["--fast"],
            "env": { "LEVEL": 3, "NAME": "w" },
        }))
        .unwrap();

        assert_eq!(options.argv, vec!["--fast".to_string()]);
        assert!(options.env.contains(&("LEVEL".to_string(), "3".to_string())));
        assert!(options.env.contains(&("NAME".to_string(), "w".to_string())));
        assert!(ProcessOptions::from_value(&json!("nope")).is_err());
    }

    #[test]
    fn test_remote_source_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let result = ScriptFile::resolve("https://example.com/w.js", dir.path(), "js");

        assert!(matches!(result, Err(BridgeError::WorkerCreation(_))));
    }

    #[test]
    fn test_missing_script_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let result = ScriptFile::resolve("/definitely/not/here.js", dir.path(), "js");

        assert!(matches!(result, Err(BridgeError::WorkerCreation(_))));
    }

    #[test]
    fn test_data_url_is_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let url = WorkerSource::Code(b"echo hi".to_vec()).into_url();

        let script = ScriptFile::resolve(&url, dir.path(), "sh").unwrap();
        let path = script.path.clone();
        assert_eq!(std::fs::read(&path).unwrap(), b"echo hi");

        drop(script);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_echo_worker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let factory = sh_factory(dir.path());
        let source = WorkerSource::Code(b"while read line; do echo \"$line\"; done".to_vec());

        let worker = factory.spawn(&source.into_url(), &Value::Null).unwrap();
        let (listener, events) = listener();
        worker.add_event_listener("message", listener);

        worker.post_message(json!({ "ping": 1 })).unwrap();
        let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(event, json!({ "type": "message", "data": { "ping": 1 } }));

        worker.terminate().unwrap();
        worker.post_message(json!("late")).unwrap();
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_and_error_events() {
        let dir = tempfile::tempdir().unwrap();
        let factory = sh_factory(dir.path());
        let source = WorkerSource::Code(b"read line; echo oops >&2; exit 3".to_vec());

        let worker = factory.spawn(&source.into_url(), &Value::Null).unwrap();
        let (error_listener, errors) = listener();
        let (exit_listener, exits) = listener();
        worker.add_event_listener("error", error_listener);
        worker.add_event_listener("exit", exit_listener);

        worker.post_message(json!("go")).unwrap();

        let error = errors.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(error, json!({ "type": "error", "data": "oops" }));
        let exit = exits.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(exit, json!({ "type": "exit", "data": 3 }));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_does_not_wait_for_a_full_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let factory = sh_factory(dir.path());
        let source = WorkerSource::Code(b"sleep 30".to_vec());
        let worker = factory.spawn(&source.into_url(), &Value::Null).unwrap();

        // Far more than a pipe buffer holds, and nothing reads it.
        let started = Instant::now();
        let payload = "x".repeat(256 * 1024);
        worker.post_message(json!(payload)).unwrap();
        worker.post_message(json!(payload)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_millis(300));
        worker.terminate().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_is_reported_after_stdout_closes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = sh_factory(dir.path());
        let source = WorkerSource::Code(b"exec 1>&-; sleep 0.3; exit 4".to_vec());

        let worker = factory.spawn(&source.into_url(), &Value::Null).unwrap();
        let (exit_listener, exits) = listener();
        worker.add_event_listener("exit", exit_listener);

        let exit = exits.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(exit, json!({ "type": "exit", "data": 4 }));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_stops_a_worker_with_closed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let factory = sh_factory(dir.path());
        let source = WorkerSource::Code(b"exec 1>&-; sleep 30".to_vec());

        let worker = factory.spawn(&source.into_url(), &Value::Null).unwrap();
        let (exit_listener, exits) = listener();
        worker.add_event_listener("exit", exit_listener);
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        worker.terminate().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(exits.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_interpreter_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::builder()
            .worker_program("ferry-no-such-interpreter")
            .worker_dir(dir.path())
            .build()
            .unwrap();
        let factory = ProcessWorkerFactory::new(Arc::new(config));
        let url = WorkerSource::Code(b"true".to_vec()).into_url();

        let result = factory.spawn(&url, &Value::Null);
        assert!(matches!(result, Err(BridgeError::WorkerCreation(_))));
    }
}
