//! Process Bridge: runs one helper script per invocation and classifies the outcome.
//!
//! # Lifecycle of a call
//! 1. Resolve the script path (missing → `HelperNotFound`).
//! 2. Serialize the payload into the single JSON argument (`InvalidInput`).
//! 3. Optionally allocate a scratch directory for the helper's working files.
//! 4. Spawn with piped stdout/stderr, each drained on its own task.
//! 5. `select!` between child exit and the timeout. Exactly one branch wins;
//!    on timeout the child's process group is terminated (SIGTERM, then
//!    SIGKILL) and the child is reaped.
//! 6. Classify exit code + captured output.
//! 7. Release the scratch directory before returning, on every path.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bridge::extract::extract;
use crate::bridge::invocation::{reported_error, HelperOutput, Invocation};
use crate::outcome::{preview, Classified, ErrorKind};
use crate::scratch::{ScratchError, ScratchSpace};
use crate::supervise::{isolate, terminate, StreamCapture};

/// Environment variable naming the invocation's scratch directory.
pub const SCRATCH_DIR_ENV: &str = "HELPER_SCRATCH_DIR";

const NO_DETAILS: &str = "No error details available";
const MAX_MESSAGE_CHARS: usize = 200;
const MAX_LOGGED_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("helper not found: {}", .0.display())]
    HelperNotFound(PathBuf),

    #[error("failed to start helper process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to serialize helper input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("helper timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration, stderr: String },

    #[error("helper exited with {}: {message}", exit_label(.code))]
    HelperCrashed {
        code: Option<i32>,
        message: String,
        stderr: String,
    },

    #[error("helper reported an error: {0}")]
    HelperReported(String),

    #[error("helper returned empty output")]
    EmptyOutput,

    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

impl Classified for BridgeError {
    fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::HelperNotFound(_) => ErrorKind::HelperNotFound,
            BridgeError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            BridgeError::InvalidInput(_) => ErrorKind::InvalidInput,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::HelperCrashed { .. } => ErrorKind::HelperCrashed,
            BridgeError::HelperReported(_) => ErrorKind::HelperReportedError,
            BridgeError::EmptyOutput => ErrorKind::EmptyOutput,
            BridgeError::Scratch(e) => e.kind(),
        }
    }

    /// Never includes filesystem paths or full stderr.
    fn public_message(&self) -> String {
        match self {
            BridgeError::HelperNotFound(_) => "Helper script is not available".to_string(),
            BridgeError::SpawnFailed(_) => "Helper process could not be started".to_string(),
            BridgeError::InvalidInput(_) => "Helper input could not be serialized".to_string(),
            BridgeError::Timeout { timeout, .. } => {
                format!("Helper timed out after {}ms", timeout.as_millis())
            }
            BridgeError::HelperCrashed { message, .. } => message.clone(),
            BridgeError::HelperReported(message) => message.clone(),
            BridgeError::EmptyOutput => "Helper returned empty output".to_string(),
            BridgeError::Scratch(e) => e.public_message(),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// Bridge configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interpreter used to run helper scripts. `None` executes the script directly.
    pub interpreter: Option<PathBuf>,
    /// Time allowed between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Time allowed for stdout/stderr to reach EOF once the child has exited.
    pub drain_grace: Duration,
    /// Parent directory for per-invocation scratch directories.
    pub scratch_root: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            kill_grace: Duration::from_secs(2),
            drain_grace: Duration::from_secs(1),
            scratch_root: std::env::temp_dir(),
        }
    }
}

/// Runs helper scripts. Cheap to share; holds no per-call state.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    config: BridgeConfig,
    scratch: ScratchSpace,
}

impl ProcessBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let scratch = ScratchSpace::new(config.scratch_root.clone(), "helper_");
        Self { config, scratch }
    }

    /// Runs `executable` with the invocation's payload as its only argument.
    pub async fn execute<T: Serialize>(
        &self,
        executable: &Path,
        invocation: &Invocation<T>,
    ) -> Result<HelperOutput, BridgeError> {
        let script = match tokio::fs::canonicalize(executable).await {
            Ok(path) if path.is_file() => path,
            _ => return Err(BridgeError::HelperNotFound(executable.to_path_buf())),
        };

        let payload = serde_json::to_string(invocation.payload())?;

        let scratch = if invocation.wants_scratch() {
            Some(self.scratch.allocate(invocation.id()).await?)
        } else {
            None
        };

        let result = self
            .run(&script, &payload, invocation, scratch.as_ref().map(|s| s.path()))
            .await;

        if let Some(dir) = scratch {
            dir.release().await;
        }

        result
    }

    async fn run<T>(
        &self,
        script: &Path,
        payload: &str,
        invocation: &Invocation<T>,
        scratch: Option<&Path>,
    ) -> Result<HelperOutput, BridgeError> {
        let id = invocation.id();
        let timeout = invocation.timeout();

        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            }
            None => Command::new(script),
        };
        isolate(&mut cmd)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = scratch {
            cmd.current_dir(dir).env(SCRATCH_DIR_ENV, dir);
        }

        info!("Invocation {id}: running helper {}", script.display());
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            warn!("Invocation {id}: failed to spawn {}: {e}", script.display());
            BridgeError::SpawnFailed(e)
        })?;
        let stdout = StreamCapture::spawn(child.stdout.take());
        let stderr = StreamCapture::spawn(child.stderr.take());

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };

        let status = match exited {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!("Invocation {id}: waiting on helper failed: {e}");
                terminate(&mut child, self.config.kill_grace).await;
                let _ = stdout.finish(Duration::ZERO).await;
                let stderr = stderr.finish_text(self.config.drain_grace).await;
                return Err(BridgeError::HelperCrashed {
                    code: None,
                    message: format!("lost track of helper process: {e}"),
                    stderr,
                });
            }
            None => {
                terminate(&mut child, self.config.kill_grace).await;
                let _ = stdout.finish(Duration::ZERO).await;
                let stderr = stderr.finish_text(self.config.drain_grace).await;
                warn!(
                    "Invocation {id}: helper timed out after {}ms; partial stderr: {}",
                    timeout.as_millis(),
                    preview(stderr.trim(), MAX_LOGGED_CHARS)
                );
                return Err(BridgeError::Timeout {
                    timeout,
                    stderr: stderr.trim().to_string(),
                });
            }
        };

        let (stdout, stderr) = tokio::join!(
            stdout.finish_text(self.config.drain_grace),
            stderr.finish_text(self.config.drain_grace)
        );

        debug!(
            "Invocation {id}: helper exited with {status} after {}ms",
            started.elapsed().as_millis()
        );
        if !stderr.trim().is_empty() {
            warn!(
                "Invocation {id}: helper stderr: {}",
                preview(stderr.trim(), MAX_LOGGED_CHARS)
            );
        }

        classify(status, stdout, stderr)
    }
}

fn classify(status: ExitStatus, stdout: String, stderr: String) -> Result<HelperOutput, BridgeError> {
    if !status.success() {
        if let Ok(value) = extract(&stdout) {
            if let Some(message) = reported_error(&value) {
                return Err(BridgeError::HelperReported(message));
            }
        }
        return Err(BridgeError::HelperCrashed {
            code: status.code(),
            message: crash_message(&stderr),
            stderr,
        });
    }

    match extract(&stdout) {
        Ok(value) => match reported_error(&value) {
            Some(message) => Err(BridgeError::HelperReported(message)),
            None => Ok(HelperOutput::Structured(value)),
        },
        Err(_) if stdout.trim().is_empty() => Err(BridgeError::EmptyOutput),
        Err(e) => {
            debug!(
                "Helper output is not JSON ({e}); returning raw text: {}",
                preview(stdout.trim(), MAX_MESSAGE_CHARS)
            );
            Ok(HelperOutput::RawText(stdout.trim().to_string()))
        }
    }
}

/// Last non-empty stderr line, e.g. the exception line of a traceback.
fn crash_message(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(|l| preview(l, MAX_MESSAGE_CHARS))
        .unwrap_or_else(|| NO_DETAILS.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    struct Fixture {
        dir: tempfile::TempDir,
        scratch_root: tempfile::TempDir,
        bridge: ProcessBridge,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scratch_root = tempfile::tempdir().unwrap();
        let bridge = ProcessBridge::new(BridgeConfig {
            interpreter: Some(PathBuf::from("/bin/sh")),
            kill_grace: Duration::from_millis(500),
            drain_grace: Duration::from_millis(500),
            scratch_root: scratch_root.path().to_path_buf(),
        });
        Fixture {
            dir,
            scratch_root,
            bridge,
        }
    }

    impl Fixture {
        fn helper(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            path
        }

        fn scratch_entries(&self) -> usize {
            std::fs::read_dir(self.scratch_root.path()).unwrap().count()
        }
    }

    fn invocation(payload: Value) -> Invocation<Value> {
        Invocation::new(payload, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_structured_output_with_log_noise() {
        let f = fixture();
        let script = f.helper(
            "score.sh",
            r#"echo "Loading model..."; echo '{"score": 82, "keywords": ["rust"]}'; echo done"#,
        );

        let out = f
            .bridge
            .execute(&script, &invocation(json!({"resume": "text"})))
            .await
            .unwrap();
        assert_eq!(
            out,
            HelperOutput::Structured(json!({"score": 82, "keywords": ["rust"]}))
        );
    }

    #[tokio::test]
    async fn test_payload_is_single_json_argument() {
        let f = fixture();
        let script = f.helper("echo.sh", r#"[ "$#" -eq 1 ] || exit 9; printf '%s' "$1""#);
        let payload = json!({"jobTitle": "Backend Engineer", "location": "Berlin", "limit": 5});

        let out = f.bridge.execute(&script, &invocation(payload.clone())).await.unwrap();
        assert_eq!(out, HelperOutput::Structured(payload));
    }

    #[tokio::test]
    async fn test_clean_exit_with_plain_text_is_raw_fallback() {
        let f = fixture();
        let script = f.helper("plain.sh", "echo 'Your resume looks great.'");

        let out = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap();
        assert_eq!(out, HelperOutput::RawText("Your resume looks great.".to_string()));
    }

    #[tokio::test]
    async fn test_clean_exit_with_no_output_is_empty_output() {
        let f = fixture();
        let script = f.helper("silent.sh", "exit 0");

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyOutput);
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_stderr_is_crash() {
        let f = fixture();
        let script = f.helper("boom.sh", "echo boom >&2; exit 3");

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperCrashed);
        assert!(err.to_string().contains("boom"));
        assert!(err.public_message().contains("boom"));
        match err {
            BridgeError::HelperCrashed { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_crash_message_is_last_traceback_line() {
        let f = fixture();
        let script = f.helper(
            "trace.sh",
            r#"printf 'Traceback (most recent call last):\n  File "/srv/app/x.py", line 3\nValueError: boom\n' >&2; exit 1"#,
        );

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.public_message(), "ValueError: boom");
        match err {
            BridgeError::HelperCrashed { stderr, .. } => assert!(stderr.contains("/srv/app/x.py")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_details() {
        let f = fixture();
        let script = f.helper("quiet_fail.sh", "exit 2");

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperCrashed);
        assert_eq!(err.public_message(), NO_DETAILS);
    }

    #[tokio::test]
    async fn test_clean_exit_with_error_payload_is_reported_error() {
        let f = fixture();
        let script = f.helper("reject.sh", r#"echo '{"error":"bad input"}'"#);

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperReportedError);
        assert_eq!(err.public_message(), "bad input");
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_error_payload_is_reported_error() {
        let f = fixture();
        let script = f.helper(
            "status_error.sh",
            r#"echo 'warning: slow'; echo '{"status":"error","message":"no matching jobs"}'; echo trace >&2; exit 1"#,
        );

        let err = f.bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperReportedError);
        assert_eq!(err.public_message(), "no matching jobs");
    }

    #[tokio::test]
    async fn test_missing_script_is_not_found() {
        let f = fixture();
        let missing = f.dir.path().join("nope.py");

        let err = f.bridge.execute(&missing, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperNotFound);
        assert!(!err.public_message().contains("nope.py"));
    }

    #[tokio::test]
    async fn test_directory_is_not_a_helper() {
        let f = fixture();
        let err = f
            .bridge
            .execute(f.dir.path(), &invocation(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperNotFound);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_failure() {
        let f = fixture();
        let script = f.helper("ok.sh", "echo '{}'");
        let bridge = ProcessBridge::new(BridgeConfig {
            interpreter: Some(PathBuf::from("/nonexistent/bin/python3")),
            ..f.bridge.config.clone()
        });

        let err = bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn test_non_executable_script_without_interpreter_is_spawn_failure() {
        let f = fixture();
        let script = f.helper("noexec.sh", "echo '{}'");
        let bridge = ProcessBridge::new(BridgeConfig {
            interpreter: None,
            ..f.bridge.config.clone()
        });

        let err = bridge.execute(&script, &invocation(json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn test_unserializable_payload_is_invalid_input() {
        let f = fixture();
        let script = f.helper("ok.sh", "echo '{}'");
        let mut payload: HashMap<Vec<u8>, i32> = HashMap::new();
        payload.insert(vec![1, 2], 3);

        let inv = Invocation::new(payload, Duration::from_secs(5));
        let err = f.bridge.execute(&script, &inv).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!err.kind().is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_terminates_helper() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let f = fixture();
        let pid_file = f.dir.path().join("helper.pid");
        let script = f.helper(
            "slow.sh",
            &format!(
                "echo $$ > '{}'; echo 'loading embeddings' >&2; exec sleep 30",
                pid_file.display()
            ),
        );

        let timeout = Duration::from_millis(400);
        let started = Instant::now();
        let err = f
            .bridge
            .execute(&script, &Invocation::new(json!({}), timeout))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(3), "took {elapsed:?}");
        match &err {
            BridgeError::Timeout { stderr, .. } => assert!(stderr.contains("loading embeddings")),
            other => panic!("unexpected {other:?}"),
        }

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(
            kill(Pid::from_raw(pid), None).is_err(),
            "helper process {pid} still running"
        );
    }

    #[tokio::test]
    async fn test_timeout_terminates_helper_subprocesses() {
        use crate::supervise::wait_until_gone;

        let f = fixture();
        let pid_file = f.dir.path().join("child.pid");
        let script = f.helper(
            "forking.sh",
            &format!("sleep 30 & echo $! > '{}'; wait", pid_file.display()),
        );

        let err = f
            .bridge
            .execute(&script, &Invocation::new(json!({}), Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(
            wait_until_gone(pid, Duration::from_secs(2)).await,
            "helper subprocess {pid} survived the timeout"
        );
    }

    #[tokio::test]
    async fn test_timeout_escalates_past_ignored_sigterm() {
        let f = fixture();
        let script = f.helper("stubborn.sh", "trap '' TERM; while true; do sleep 0.1; done");

        let started = Instant::now();
        let err = f
            .bridge
            .execute(&script, &Invocation::new(json!({}), Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_scratch_directory_is_working_dir_and_released() {
        let f = fixture();
        let script = f.helper(
            "cwd.sh",
            r#"printf '{"cwd":"%s","env":"%s"}' "$(pwd -P)" "$HELPER_SCRATCH_DIR""#,
        );

        let inv = invocation(json!({})).with_scratch();
        let out = f.bridge.execute(&script, &inv).await.unwrap();
        let value = match out {
            HelperOutput::Structured(value) => value,
            other => panic!("expected structured output, got {other:?}"),
        };

        let root = std::fs::canonicalize(f.scratch_root.path()).unwrap();
        let cwd = PathBuf::from(value["cwd"].as_str().unwrap());
        assert!(cwd.starts_with(&root), "{cwd:?} not under {root:?}");
        assert!(cwd.ends_with(format!("helper_{}", inv.id().simple())));
        assert!(!value["env"].as_str().unwrap().is_empty());
        assert_eq!(f.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_scratch_released_after_timeout_and_crash() {
        let f = fixture();
        let slow = f.helper("slow.sh", "touch partial.json; exec sleep 30");
        let crash = f.helper("crash.sh", "touch partial.json; exit 4");

        let timed_out = f
            .bridge
            .execute(&slow, &Invocation::new(json!({}), Duration::from_millis(200)).with_scratch())
            .await
            .unwrap_err();
        assert_eq!(timed_out.kind(), ErrorKind::Timeout);

        let crashed = f
            .bridge
            .execute(&crash, &invocation(json!({})).with_scratch())
            .await
            .unwrap_err();
        assert_eq!(crashed.kind(), ErrorKind::HelperCrashed);

        assert_eq!(f.scratch_entries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invocations_do_not_interfere() {
        let f = fixture();
        let script = f.helper(
            "roundtrip.sh",
            r#"printf '%s' "$1" > input.json; sleep 0.2; cat input.json"#,
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let bridge = f.bridge.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let payload = json!({"request": i, "text": format!("resume {i}")});
                    let out = bridge
                        .execute(&script, &invocation(payload.clone()).with_scratch())
                        .await
                        .unwrap();
                    (payload, out)
                })
            })
            .collect();

        for h in handles {
            let (payload, out) = h.await.unwrap();
            assert_eq!(out, HelperOutput::Structured(payload));
        }
        assert_eq!(f.scratch_entries(), 0);
    }

    #[test]
    fn test_crash_message_defaults() {
        assert_eq!(crash_message(""), NO_DETAILS);
        assert_eq!(crash_message("  \n\n"), NO_DETAILS);
        assert_eq!(crash_message("first\nsecond\n"), "second");
    }
}
