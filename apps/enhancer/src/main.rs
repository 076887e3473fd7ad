mod bridge;
mod config;
mod errors;
mod latex;
mod outcome;
mod routes;
mod scratch;
mod state;
mod supervise;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::{BridgeConfig, ProcessBridge};
use crate::config::Config;
use crate::latex::{CompilationPipeline, TexCompiler};
use crate::routes::build_router;
use crate::scratch::ScratchSpace;
use crate::state::AppState;

/// How long to keep reading a helper's pipes after it exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Enhancer API v{}", env!("CARGO_PKG_VERSION"));

    // Helper bridge
    let bridge = ProcessBridge::new(BridgeConfig {
        interpreter: Some(config.interpreter.clone()),
        kill_grace: config.kill_grace,
        drain_grace: DRAIN_GRACE,
        scratch_root: config.scratch_root.clone(),
    });
    info!(
        "Helper bridge initialized (project: {}, interpreter: {}, scripts: {})",
        config.project_root.display(),
        config.interpreter.display(),
        config.helper_scripts_dir.display()
    );

    // LaTeX pipeline
    let compiler = build_compiler(&config);
    let pipeline = CompilationPipeline::new(
        ScratchSpace::new(config.scratch_root.clone(), "latex_"),
        Arc::new(compiler),
    );
    info!(
        "LaTeX pipeline initialized (compiler: {}, scratch root: {})",
        config.latex_command.join(" "),
        config.scratch_root.display()
    );

    // Build app state
    let state = AppState {
        config: config.clone(),
        bridge: Arc::new(bridge),
        pipeline: Arc::new(pipeline),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// `LATEX_COMPILER` may name a wrapper (`nice -n 10 pdflatex`); the first word is
/// the program that gets spawned and the rest are passed ahead of the TeX flags.
fn build_compiler(config: &Config) -> TexCompiler {
    let (program, rest) = match config.latex_command.split_first() {
        Some((program, rest)) => (program.as_str(), rest),
        None => ("pdflatex", &[][..]),
    };
    TexCompiler::new(program, config.latex_timeout, config.kill_grace)
        .with_leading_args(rest.iter().cloned())
}
