mod api;
mod auth;
mod cast;
mod config;
mod delivery;
mod error;
mod pricing;
mod state;
mod store;
mod transcode;
mod video;

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::QuickAuthVerifier,
    cast::NeynarClient,
    config::Config,
    delivery::DOWNLOAD_FILENAME_HEADER,
    error::ApiError,
    state::{AppState, build_api_client},
    store::Store,
    transcode::cleanup_stale_outputs,
};

const STALE_OUTPUT_SECONDS: u64 = 2 * 60 * 60;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cast_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        match error.body.details {
            Some(details) => eprintln!("Server error: {} ({details})", error.body.error),
            None => eprintln!("Server error: {}", error.body.error),
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal("could not create the transfer directory")
                .with_details(format!("{:?}: {error}", config.transfer_dir))
        })?;
    cleanup_stale_outputs(&config.transfer_dir, Duration::from_secs(STALE_OUTPUT_SECONDS)).await;

    let store = Store::connect(&config.database_url).await.map_err(|error| {
        ApiError::internal("could not open the record store").with_details(error.to_string())
    })?;
    let api_client = build_api_client(&config).map_err(|error| {
        ApiError::internal("could not build the HTTP client").with_details(error.to_string())
    })?;

    if config.neynar_api_key.is_none() {
        warn!("NEYNAR_API_KEY is not set. Cast hashes cannot be resolved, only direct URLs.");
    }
    if config.confirm_secret.is_none() {
        warn!("WC_SECRET is not set. Payment confirmation and wallet linking are unguarded.");
    }
    warn!("Payment confirmation trusts the client-reported transaction; nothing is checked on-chain.");

    let verifier = Arc::new(QuickAuthVerifier::new(
        api_client.clone(),
        config.quick_auth_origin.clone(),
    ));
    let lookup = Arc::new(NeynarClient::new(
        api_client,
        config.neynar_api_base.clone(),
        config.neynar_api_key.clone(),
    ));

    let cors = build_cors_layer(&config.allowed_origins)?;
    let addr = config.bind_addr.clone();

    let state = AppState::new(config, store, verifier, lookup).map_err(|error| {
        ApiError::internal("could not build the media client").with_details(error.to_string())
    })?;

    let mut app = api::router(state);
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("could not bind {addr}")).with_details(error.to_string())
    })?;

    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal("HTTP server error").with_details(error.to_string()))
}

/// Cross-origin access is only opened up when an allow-list is configured.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!("CORS allow-list loaded with {} origin(s)", normalized_origins.len());

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(?origin, allowed, "CORS origin check");
        allowed
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([
                CONTENT_DISPOSITION,
                HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
            ]),
    ))
}

/// `scheme://host[:port]` with the default port dropped, or `None` for
/// anything that is not a bare http(s) origin.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already elides the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
