//! The payment-gated download pipeline:
//! authenticate, load user, price, gate, resolve, deliver.
//!
//! Gate-side writes (a new pending intent, today's free-image mark) are not
//! rolled back if a later step fails.

use axum::{extract::State, response::Response};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::{
    api::{body::JsonBody, payments::new_payment_intent},
    auth::AuthUser,
    cast::{ResolveError, is_hls_url},
    config::non_empty,
    delivery::{TempFile, file_response, filename_from_url, process_response, proxy_response, redirect_response},
    error::ApiError,
    pricing::{self, MediaKind, Quality},
    state::AppState,
    store::{Store, User},
    transcode::TranscodeError,
    video::{ExtractError, format_selector, is_video_platform_url},
};

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: Option<String>,
    hash: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    quality: Option<String>,
}

pub async fn download(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<DownloadRequest>,
) -> Result<Response, ApiError> {
    let reference = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .or_else(|| payload.hash.as_deref().and_then(non_empty));
    let kind = payload.kind.as_deref().and_then(non_empty);
    let (Some(reference), Some(kind)) = (reference, kind) else {
        return Err(ApiError::bad_request("missing url/hash or type"));
    };
    let kind = MediaKind::parse(kind);
    let quality = Quality::parse(payload.quality.as_deref())
        .ok_or_else(|| ApiError::bad_request("invalid quality"))?;

    let account = state
        .store
        .get_user(&user.fid)
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown user"))?;

    authorize(&state.store, &account, kind, quality, Utc::now().date_naive()).await?;

    let media_url = state
        .resolver
        .resolve(reference, kind)
        .await
        .map_err(resolve_error)?;
    debug!(fid = %account.id, media_url, kind = kind.as_str(), "resolved download");

    deliver(&state, &media_url, kind, quality).await
}

/// Price the request and decide whether it may proceed. Claims the daily
/// free image and creates pending intents as side effects.
///
/// Paying only unlocks a tier. An unsubscribed user who already spent
/// today's free image still gets `daily free image already used` after
/// paying for another one, and unsubscribed users never get video.
async fn authorize(
    store: &Store,
    user: &User,
    kind: MediaKind,
    quality: Quality,
    today: NaiveDate,
) -> Result<(), ApiError> {
    let mut user = user.clone();

    if kind == MediaKind::Image && pricing::has_free_image(&user, today) {
        if store.claim_free_image(&user.id, today).await? {
            info!(fid = %user.id, "consumed daily free image");
            return Ok(());
        }
        // A concurrent request took it first.
        debug!(fid = %user.id, "daily free image already claimed");
        user.last_free_image_date = Some(today);
    }

    let amount = pricing::price(kind, quality, &user, today);
    if amount > 0.0 && !store.has_paid_for(&user.id, kind, quality).await? {
        let intent = new_payment_intent(&user.id, kind, quality, amount);
        store.create_payment_intent(&intent).await?;
        info!(fid = %user.id, intent = %intent.id, amount, "download requires payment");
        return Err(ApiError::payment_required(intent.id, amount, kind, quality));
    }

    match kind {
        MediaKind::Image if !user.is_subscribed => {
            Err(ApiError::subscription_required("daily free image already used"))
        }
        MediaKind::Video if !user.is_subscribed => Err(ApiError::subscription_required(
            "video download requires subscription",
        )),
        _ => Ok(()),
    }
}

fn resolve_error(error: ResolveError) -> ApiError {
    match error {
        ResolveError::Lookup(error) => {
            ApiError::bad_request("failed to resolve cast hash").with_details(error.to_string())
        }
        ResolveError::NoMedia => ApiError::not_found("no media found in cast"),
    }
}

fn extract_error(error: ExtractError) -> ApiError {
    match error {
        ExtractError::Unavailable(details) => {
            error!("video extraction unavailable: {details}");
            ApiError::internal("video extraction requires yt-dlp").with_details(details)
        }
        other => ApiError::server_error(other.to_string(), None),
    }
}

fn transcode_error(error: TranscodeError) -> ApiError {
    match error {
        TranscodeError::Unavailable(details) => {
            error!("HLS conversion unavailable: {details}");
            ApiError::not_implemented("HLS to MP4 requires ffmpeg").with_details(details)
        }
        other => {
            error!("ffmpeg HLS->MP4 error: {other}");
            ApiError::internal("failed to convert HLS to mp4").with_details(other.to_string())
        }
    }
}

async fn deliver(
    state: &AppState,
    url: &str,
    kind: MediaKind,
    quality: Quality,
) -> Result<Response, ApiError> {
    if is_video_platform_url(url) {
        debug!(url, "delivering through video platform extraction");
        return deliver_from_platform(state, url, kind, quality).await;
    }

    if kind == MediaKind::Video && is_hls_url(url) {
        debug!(url, "delivering HLS manifest as MP4");
        return deliver_transcoded(state, url, quality).await;
    }

    proxy_response(&state.media_client, url, kind).await
}

async fn deliver_from_platform(
    state: &AppState,
    url: &str,
    kind: MediaKind,
    quality: Quality,
) -> Result<Response, ApiError> {
    let info = state.extractor.fetch_info(url).await.map_err(extract_error)?;

    if kind == MediaKind::Image {
        let thumbnail = info
            .best_thumbnail()
            .ok_or_else(|| ApiError::not_found("no thumbnail available"))?;
        return redirect_response(thumbnail);
    }

    let selector = format_selector(&info, quality);
    let title = info.title.as_deref().and_then(non_empty).unwrap_or("video");
    debug!(url, selector, "streaming platform video");

    let download = state
        .extractor
        .spawn_download(url, &selector)
        .map_err(extract_error)?;
    process_response(download, &format!("{title}.mp4"), "video/mp4").await
}

async fn deliver_transcoded(
    state: &AppState,
    url: &str,
    quality: Quality,
) -> Result<Response, ApiError> {
    // Dropping the guard on any early return deletes partial output.
    let output = TempFile::new(state.transcoder.allocate_output());
    state
        .transcoder
        .convert(url, quality, output.path())
        .await
        .map_err(transcode_error)?;

    let filename = format!("{}.mp4", manifest_base_name(url));
    file_response(output, &filename, "video/mp4").await
}

/// File name of the manifest without its `.m3u8` suffix.
fn manifest_base_name(url: &str) -> String {
    let name = filename_from_url(url).unwrap_or_default();
    let stem = if name.to_ascii_lowercase().ends_with(".m3u8") {
        &name[..name.len() - ".m3u8".len()]
    } else {
        name.as_str()
    };

    non_empty(stem).unwrap_or("video").to_string()
}
