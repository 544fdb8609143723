use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    api::body::JsonBody, cast::CastMedia, config::non_empty, error::ApiError, state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    has_neynar_key: bool,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        has_neynar_key: state.resolver.lookup().is_configured(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CastMediaRequest {
    hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CastMediaResponse {
    media: Vec<CastMedia>,
}

pub async fn cast_media(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<CastMediaRequest>,
) -> Result<Json<CastMediaResponse>, ApiError> {
    let hash = payload
        .hash
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("missing cast hash"))?;

    let media = state.resolver.lookup().list_media(hash).await.map_err(|err| {
        error!(hash, "cast media lookup failed: {err}");
        ApiError::internal(err.to_string())
    })?;

    if media.is_empty() {
        return Err(ApiError::not_found("no media found in cast"));
    }
    Ok(Json(CastMediaResponse { media }))
}
