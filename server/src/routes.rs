//! HTTP surface (spec.md §4.E, §6): the artifact download endpoint and a
//! liveness probe, in the same shape as a `server/api/health.rs`.

use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sai_taskdb::TaskDbError;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/artifacts/:task_uuid/:down_nonce/:filename",
            get(download_artifact),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// `GET /artifacts/<task_uuid>/<down_nonce>/<filename>` (spec.md §4.E):
/// serves a build artifact by its unguessable download nonce, no
/// session cookie required.
async fn download_artifact(
    State(state): State<AppState>,
    Path((task_uuid, down_nonce, filename)): Path<(String, String, String)>,
) -> Response {
    match state
        .task_store
        .read_artifact(&task_uuid, &down_nonce, &filename)
    {
        Ok((row, bytes)) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", row.blob_filename),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(TaskDbError::NoSuchArtifact(_)) | Err(TaskDbError::NoSuchTask(_)) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(TaskDbError::Domain(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "artifact download failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
