//! Axum route handlers for LaTeX detection and compilation.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{status_for, AppError};
use crate::latex::{extract_latex_content, is_latex_content};
use crate::outcome::{Classified, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub has_latex: bool,
    pub latex: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    pub text: String,
    pub base_name: String,
}

/// POST /api/v1/documents/detect
///
/// Reports whether `text` embeds a compilable LaTeX document and returns it.
pub async fn handle_detect(Json(request): Json<DetectRequest>) -> Json<DetectResponse> {
    Json(DetectResponse {
        has_latex: is_latex_content(&request.text),
        latex: extract_latex_content(&request.text),
    })
}

/// POST /api/v1/documents/compile
///
/// Detect → extract → compile. On success the envelope data carries the base64
/// PDF, its filename, and the extracted source. A failed compile still returns
/// the extracted source as `latex` next to the error.
pub async fn handle_compile(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> Result<Response, AppError> {
    let latex = extract_latex_content(&request.text).ok_or_else(|| {
        AppError::UnprocessableEntity("No LaTeX document found in text".to_string())
    })?;

    match state.pipeline.compile(&latex, &request.base_name).await {
        Ok(artifact) => {
            let mut data = serde_json::to_value(&artifact).map_err(anyhow::Error::from)?;
            data["latex"] = Value::String(latex);
            Ok(Envelope::success(data).into_response())
        }
        Err(e) => {
            warn!(
                "PDF conversion failed for '{}' (kind {:?}); returning error envelope",
                request.base_name,
                e.kind()
            );
            let mut body = serde_json::to_value(Envelope::error(&e)).map_err(anyhow::Error::from)?;
            body["latex"] = Value::String(latex);
            Ok((status_for(e.kind()), Json(body)).into_response())
        }
    }
}
