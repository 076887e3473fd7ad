//! Compilation Pipeline: markup in, base64 document out.
//!
//! Job stages:
//! `Created → ScratchAllocated → SourceWritten → CompilerRunning → {Succeeded | Failed} → ScratchReleased`
//!
//! The scratch directory is owned by `compile`'s stack frame. It is released
//! explicitly after the job resolves, and by `Drop` if the future is cancelled
//! or a compiler implementation panics, so no stage can leak it.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::latex::compiler::{log_failure, DocumentCompiler};
use crate::outcome::{Classified, ErrorKind};
use crate::scratch::{ScratchDirectory, ScratchError, ScratchSpace};

const MAX_BASE_NAME_CHARS: usize = 64;
const DEFAULT_BASE_NAME: &str = "document";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Scratch(#[from] ScratchError),

    #[error("{0}")]
    CompilationFailed(String),
}

impl Classified for CompileError {
    fn kind(&self) -> ErrorKind {
        match self {
            CompileError::Scratch(e) => e.kind(),
            CompileError::CompilationFailed(_) => ErrorKind::CompilationFailed,
        }
    }

    fn public_message(&self) -> String {
        match self {
            CompileError::Scratch(e) => e.public_message(),
            CompileError::CompilationFailed(message) => message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStage {
    Created,
    ScratchAllocated,
    SourceWritten,
    CompilerRunning,
    Succeeded,
    Failed,
    ScratchReleased,
}

/// A compiled document, ready for transport. Not retained by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledArtifact {
    pub filename: String,
    /// Standard base64 encoding of the document bytes.
    #[serde(rename = "pdf")]
    pub content_base64: String,
    pub size_bytes: usize,
}

#[derive(Clone)]
pub struct CompilationPipeline {
    scratch: ScratchSpace,
    compiler: Arc<dyn DocumentCompiler>,
}

impl CompilationPipeline {
    pub fn new(scratch: ScratchSpace, compiler: Arc<dyn DocumentCompiler>) -> Self {
        Self { scratch, compiler }
    }

    /// Compiles `markup` into `<sanitized base_name>.<ext>`.
    pub async fn compile(
        &self,
        markup: &str,
        base_name: &str,
    ) -> Result<CompiledArtifact, CompileError> {
        let job = Uuid::new_v4();
        let base = sanitize_base_name(base_name);
        trace_stage(job, JobStage::Created);

        if markup.trim().is_empty() {
            return Err(CompileError::CompilationFailed(
                "No LaTeX content to compile".to_string(),
            ));
        }

        let mut scratch = self.scratch.allocate(job).await?;
        trace_stage(job, JobStage::ScratchAllocated);

        let result = self.run(job, &mut scratch, markup, &base).await;
        trace_stage(
            job,
            if result.is_ok() {
                JobStage::Succeeded
            } else {
                JobStage::Failed
            },
        );

        scratch.release().await;
        trace_stage(job, JobStage::ScratchReleased);

        result
    }

    async fn run(
        &self,
        job: Uuid,
        scratch: &mut ScratchDirectory,
        markup: &str,
        base: &str,
    ) -> Result<CompiledArtifact, CompileError> {
        let source_name = format!("{base}.{}", self.compiler.source_extension());
        let source = scratch.write_file(&source_name, markup.as_bytes()).await?;
        trace_stage(job, JobStage::SourceWritten);

        trace_stage(job, JobStage::CompilerRunning);
        let bytes = match self.compiler.compile(&source, scratch.path()).await {
            Ok(bytes) if bytes.is_empty() => {
                return Err(CompileError::CompilationFailed(
                    "LaTeX compiler produced an empty document".to_string(),
                ))
            }
            Ok(bytes) => bytes,
            Err(failure) => {
                log_failure(&job.to_string(), &failure);
                return Err(CompileError::CompilationFailed(failure.message));
            }
        };

        let filename = format!("{base}.{}", self.compiler.output_extension());
        info!("Compilation {job} produced {filename} ({} bytes)", bytes.len());

        Ok(CompiledArtifact {
            filename,
            content_base64: STANDARD.encode(&bytes),
            size_bytes: bytes.len(),
        })
    }
}

fn trace_stage(job: Uuid, stage: JobStage) {
    debug!("Compilation {job}: {stage:?}");
}

/// Maps every character outside `[A-Za-z0-9_-]` to `_`.
pub fn sanitize_base_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .take(MAX_BASE_NAME_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        DEFAULT_BASE_NAME.to_string()
    } else {
        cleaned
    }
}
