//! Axum route handlers for helper invocations.

use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::bridge::Invocation;
use crate::errors::AppError;
use crate::outcome::{Classified, Envelope};
use crate::state::AppState;

const HELPER_EXTENSION: &str = "py";
/// Upper bound on a caller-requested timeout.
const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct RunHelperRequest {
    #[serde(default)]
    pub payload: Value,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub scratch: bool,
}

/// POST /api/v1/helpers/:name
///
/// Runs `<HELPER_SCRIPTS_DIR>/<name>.py` with the request payload and returns the
/// classified envelope.
pub async fn handle_run_helper(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RunHelperRequest>,
) -> Result<Envelope, AppError> {
    let script = helper_script_path(&state.config.helper_scripts_dir, &name)?;

    let timeout = match request.timeout_secs {
        Some(0) => {
            return Err(AppError::Validation(
                "timeout_secs must be greater than zero".to_string(),
            ))
        }
        Some(secs) => Duration::from_secs(secs.min(MAX_TIMEOUT_SECS)),
        None => state.config.helper_timeout,
    };

    let mut invocation = Invocation::new(request.payload, timeout);
    if request.scratch {
        invocation = invocation.with_scratch();
    }

    let result = state.bridge.execute(&script, &invocation).await;
    if let Err(e) = &result {
        warn!(
            "Helper '{name}' failed (invocation {}, kind {:?}): {e}",
            invocation.id(),
            e.kind()
        );
    }

    Ok(Envelope::from_result(result))
}

/// Maps a helper name onto its script path. Names are restricted to
/// `[A-Za-z0-9_-]+` so they cannot leave the scripts directory.
fn helper_script_path(scripts_dir: &FsPath, name: &str) -> Result<PathBuf, AppError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(AppError::Validation(format!("Invalid helper name '{name}'")));
    }
    Ok(scripts_dir.join(format!("{name}.{HELPER_EXTENSION}")))
}
