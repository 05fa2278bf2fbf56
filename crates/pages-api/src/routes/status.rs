//! Status callbacks from running build containers.
//!
//! Each build and build task carries a secret token that is baked into its
//! callback URL. Updates go through the same ledger as the dispatch worker,
//! so a callback racing the poll loop can never reopen a finished record.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use pages_core::{BuildId, BuildState, BuildTaskId, StatusUpdate};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/build/{id}/status/{token}", post(build_status))
        .route("/tasks/{id}/status/{token}", post(task_status))
}

/// Compare a presented callback token with the stored one in constant time.
///
/// Both tokens are reduced to an HMAC tag so `verify_slice` compares equal
/// length values whatever the input lengths.
fn token_matches(expected: &str, presented: &str) -> bool {
    let tag = |key: &str| {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC can take any size key");
        mac.update(b"pages-status-callback");
        mac
    };
    let presented = tag(presented).finalize().into_bytes();
    tag(expected).verify_slice(&presented).is_ok()
}

/// Status as posted by a build container.
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "commitSha")]
    pub commit_sha: Option<String>,
}

impl StatusRequest {
    fn into_update(self) -> Result<StatusUpdate, ApiError> {
        let status: BuildState = self
            .status
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("unknown status {:?}", self.status)))?;
        Ok(StatusUpdate {
            status,
            message: self.message,
            commit_sha: self.commit_sha,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: BuildState,
}

async fn build_status(
    State(state): State<AppState>,
    Path((id, token)): Path<(BuildId, String)>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let build = state.builds.get_build(id).await?;
    if !token_matches(&build.token, &token) {
        warn!(build_id = %id, "Rejected build status with wrong token");
        return Err(ApiError::Forbidden("invalid build token".to_string()));
    }

    let update = request.into_update()?;
    info!(build_id = %id, status = %update.status, "Received build status");
    let build = state.ledger.record_build(id, &update).await?;

    Ok(Json(StatusResponse { state: build.state }))
}

async fn task_status(
    State(state): State<AppState>,
    Path((id, token)): Path<(BuildTaskId, String)>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let task = state.builds.get_build_task(id).await?;
    if !token_matches(&task.token, &token) {
        warn!(task_id = %id, "Rejected build task status with wrong token");
        return Err(ApiError::Forbidden("invalid build task token".to_string()));
    }

    let update = request.into_update()?;
    info!(task_id = %id, status = %update.status, "Received build task status");
    let task = state.ledger.record_task(id, &update).await?;

    Ok(Json(StatusResponse { state: task.state }))
}
