use std::sync::Arc;

use crate::bridge::ProcessBridge;
use crate::config::Config;
use crate::latex::CompilationPipeline;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Helper bridge. Holds no per-call state; invocations run independently.
    pub bridge: Arc<ProcessBridge>,
    /// LaTeX → PDF pipeline backed by the configured compiler.
    pub pipeline: Arc<CompilationPipeline>,
}
