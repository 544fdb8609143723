//! HTTP surface.

mod body;
mod download;
mod media;
mod payments;


use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(media::healthz))
        .route("/api/status", get(media::status))
        .route("/api/cast-media", post(media::cast_media))
        .route("/api/pricing", get(payments::pricing))
        .route("/api/pay-intent", post(payments::pay_intent))
        .route("/api/pay-confirm", post(payments::pay_confirm))
        .route("/api/wallet/link", post(payments::link_wallet))
        .route("/api/subscribe", post(payments::subscribe))
        .route("/api/download", post(download::download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
