//! Document compiler seam: pluggable, trait-based.
//!
//! Default: `TexCompiler` (external `pdflatex` or a compatible engine, single
//! pass, confined to the job's scratch directory). Tests substitute fakes to
//! inject failures at each pipeline stage.
//!
//! `AppState` holds the pipeline, which holds an `Arc<dyn DocumentCompiler>`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::outcome::preview;
use crate::supervise::{isolate, terminate, StreamCapture};

const READ_CHUNK: usize = 64 * 1024;
const MAX_LOGGED_CHARS: usize = 8000;

/// A failed compiler run.
///
/// `message` is safe to show a caller; `log` holds the full diagnostic output and
/// stays server-side.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CompilerFailure {
    pub message: String,
    pub log: Option<String>,
}

impl CompilerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Turns a source file inside `workdir` into binary document bytes.
///
/// Implementations must only read and write inside `workdir`.
#[async_trait]
pub trait DocumentCompiler: Send + Sync {
    async fn compile(&self, source: &Path, workdir: &Path) -> Result<Bytes, CompilerFailure>;

    /// Extension of the produced artifact, without the dot.
    fn output_extension(&self) -> &'static str;

    /// Extension of the source file the compiler expects, without the dot.
    fn source_extension(&self) -> &'static str;
}

// ────────────────────────────────────────────────────────────────────────────
// pdflatex
// ────────────────────────────────────────────────────────────────────────────

/// Runs a pdflatex-compatible engine. `leading_args` go before the standard
/// flags, so wrappers such as `nice -n 10 pdflatex` can be configured.
#[derive(Debug, Clone)]
pub struct TexCompiler {
    program: PathBuf,
    leading_args: Vec<OsString>,
    timeout: Duration,
    kill_grace: Duration,
}

impl TexCompiler {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout,
            kill_grace,
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments for a single non-interactive pass that writes next to the source.
    fn args(source: &Path, workdir: &Path) -> Vec<OsString> {
        vec![
            "-interaction=nonstopmode".into(),
            "-halt-on-error".into(),
            "-no-shell-escape".into(),
            "-output-directory".into(),
            workdir.as_os_str().to_owned(),
            source.as_os_str().to_owned(),
        ]
    }
}

#[async_trait]
impl DocumentCompiler for TexCompiler {
    async fn compile(&self, source: &Path, workdir: &Path) -> Result<Bytes, CompilerFailure> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| CompilerFailure::new("LaTeX source has no file name"))?;

        // TEXINPUTS with a trailing separator: the job directory first, then the
        // system TeX tree (class and package files only).
        let mut texinputs = workdir.as_os_str().to_owned();
        texinputs.push(":");

        let mut cmd = Command::new(&self.program);
        isolate(&mut cmd)
            .args(&self.leading_args)
            .args(Self::args(source, workdir))
            .current_dir(workdir)
            .env("TEXINPUTS", texinputs)
            .env("openin_any", "p")
            .env("openout_any", "p")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} on {}", self.program.display(), source.display());
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to start LaTeX compiler {}: {e}", self.program.display());
            CompilerFailure::new("LaTeX compiler is not available")
        })?;

        let stdout = StreamCapture::spawn(child.stdout.take());
        let stderr = StreamCapture::spawn(child.stderr.take());

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(self.timeout) => None,
        };

        let status = match exited {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                terminate(&mut child, self.kill_grace).await;
                return Err(CompilerFailure::new(format!("LaTeX compiler wait failed: {e}")));
            }
            None => {
                terminate(&mut child, self.kill_grace).await;
                let console = stdout.finish_text(Duration::ZERO).await;
                let _ = stderr.finish(Duration::ZERO).await;
                return Err(CompilerFailure::new(format!(
                    "LaTeX compilation timed out after {:?}",
                    self.timeout
                ))
                .with_log(console));
            }
        };

        let grace = Duration::from_secs(1);
        let (console, errors) = tokio::join!(stdout.finish_text(grace), stderr.finish_text(grace));

        if !status.success() {
            // pdflatex writes its transcript to <stem>.log in the output directory.
            let log_path = workdir.join(format!("{stem}.log"));
            let log = tokio::fs::read_to_string(&log_path)
                .await
                .unwrap_or_else(|_| format!("{console}\n{errors}"));
            let message = match first_error_line(&log, workdir) {
                Some(line) => format!("LaTeX compilation failed: {line}"),
                None => format!("LaTeX compilation failed ({status})"),
            };
            return Err(CompilerFailure::new(message).with_log(log));
        }

        let pdf_path = workdir.join(format!("{stem}.{}", self.output_extension()));
        let bytes = read_output(&pdf_path).await.map_err(|e| {
            CompilerFailure::new("LaTeX compiler produced no output")
                .with_log(format!("{}: {e}\n{console}", pdf_path.display()))
        })?;

        info!("Compiled {} ({} bytes)", source.display(), bytes.len());
        Ok(bytes)
    }

    fn output_extension(&self) -> &'static str {
        "pdf"
    }

    fn source_extension(&self) -> &'static str {
        "tex"
    }
}

/// Reads a compiled artifact chunk by chunk into one contiguous buffer.
pub(crate) async fn read_output(path: &Path) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

/// First `! ...` error line of a TeX transcript, without the leading `!`.
/// Paths inside `workdir` are rewritten relative to it.
pub(crate) fn first_error_line(log: &str, workdir: &Path) -> Option<String> {
    let dir = workdir.to_string_lossy();
    log.lines()
        .find_map(|l| l.strip_prefix('!'))
        .map(|l| strip_workdir(l.trim(), &dir))
        .map(|l| preview(&l, 200))
        .filter(|l| !l.is_empty())
}

fn strip_workdir(line: &str, dir: &str) -> String {
    if dir.is_empty() {
        return line.to_string();
    }
    line.replace(&format!("{dir}/"), "").replace(dir, ".")
}

/// Logs a failed run's diagnostics server-side.
pub(crate) fn log_failure(job: &str, failure: &CompilerFailure) {
    match &failure.log {
        Some(log) => error!(
            "Compilation {job} failed: {}\n--- compiler log ---\n{}",
            failure.message,
            preview(log, MAX_LOGGED_CHARS)
        ),
        None => error!("Compilation {job} failed: {}", failure.message),
    }
}
