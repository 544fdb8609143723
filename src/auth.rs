//! Bearer-token authentication against the Quick Auth identity service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{
        HeaderMap,
        header::{AUTHORIZATION, HOST},
        request::Parts,
    },
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, jwk::JwkSet};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{config::non_empty, error::ApiError, state::AppState};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("verification backend error: {0}")]
    Backend(String),
}

impl AuthError {
    fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidToken(err.to_string())
    }

    fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Verifies identity tokens and yields the caller's fid.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, domain: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct QuickAuthClaims {
    sub: serde_json::Value,
}

/// Minimum spacing between key set downloads. An unknown `kid` inside this
/// window is rejected from the cache.
const KEY_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Default)]
struct KeyCache {
    keys: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

/// Verifies Quick Auth JWTs locally with the issuer's published key set.
pub struct QuickAuthVerifier {
    client: reqwest::Client,
    origin: String,
    refresh_cooldown: Duration,
    cache: RwLock<KeyCache>,
}

impl QuickAuthVerifier {
    pub fn new(client: reqwest::Client, origin: impl Into<String>) -> Self {
        Self {
            client,
            origin: origin.into(),
            refresh_cooldown: KEY_REFRESH_COOLDOWN,
            cache: RwLock::new(KeyCache::default()),
        }
    }

    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        let url = format!("{}/.well-known/jwks.json", self.origin);
        let keys = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(AuthError::backend)?
            .error_for_status()
            .map_err(AuthError::backend)?
            .json::<JwkSet>()
            .await
            .map_err(AuthError::backend)?;
        info!("Loaded {} identity signing key(s) from {url}", keys.keys.len());
        Ok(keys)
    }

    fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Result<DecodingKey, AuthError>> {
        let jwk = match kid {
            Some(kid) => keys.find(kid),
            None => keys.keys.first(),
        }?;
        Some(DecodingKey::from_jwk(jwk).map_err(AuthError::backend))
    }

    /// Cached keys first. An unknown `kid` refreshes the set at most once per
    /// cooldown window; concurrent misses share one download.
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        if let Some(keys) = self.cache.read().await.keys.as_ref()
            && let Some(key) = Self::select_key(keys, kid)
        {
            return key;
        }

        let mut cache = self.cache.write().await;
        if let Some(keys) = cache.keys.as_ref()
            && let Some(key) = Self::select_key(keys, kid)
        {
            return key;
        }
        if cache
            .fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < self.refresh_cooldown)
        {
            debug!(?kid, "unknown signing key inside the refresh cooldown");
            return Err(unknown_kid(kid));
        }

        let refreshed = self.fetch_keys().await?;
        let key = Self::select_key(&refreshed, kid);
        cache.keys = Some(refreshed);
        cache.fetched_at = Some(Instant::now());

        key.unwrap_or_else(|| Err(unknown_kid(kid)))
    }
}

fn unknown_kid(kid: Option<&str>) -> AuthError {
    AuthError::InvalidToken(format!("no signing key matches kid {kid:?}"))
}

#[async_trait]
impl TokenVerifier for QuickAuthVerifier {
    async fn verify(&self, token: &str, domain: &str) -> Result<String, AuthError> {
        let header = decode_header(token).map_err(AuthError::invalid)?;
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[self.origin.as_str()]);
        validation.set_audience(&[domain]);

        let data = decode::<QuickAuthClaims>(token, &key, &validation).map_err(AuthError::invalid)?;
        subject_to_fid(&data.claims.sub)
    }
}

/// The `sub` claim carries the fid, as a number or a string.
fn subject_to_fid(subject: &serde_json::Value) -> Result<String, AuthError> {
    match subject {
        serde_json::Value::Number(number) => Ok(number.to_string()),
        serde_json::Value::String(value) => non_empty(value)
            .map(ToString::to_string)
            .ok_or_else(|| AuthError::InvalidToken("empty subject".to_string())),
        other => Err(AuthError::InvalidToken(format!("unexpected subject {other}"))),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(non_empty)
}

/// Configured domain, else the request's `Host`, else `localhost`.
pub fn token_domain(configured: Option<&str>, headers: &HeaderMap) -> String {
    configured
        .and_then(non_empty)
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .and_then(non_empty)
        })
        .unwrap_or("localhost")
        .to_string()
}

/// An authenticated caller. Extracting one also ensures the user record.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub fid: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        let domain = token_domain(state.config.miniapp_domain.as_deref(), &parts.headers);
        let fid = state.verifier.verify(token, &domain).await?;
        debug!(fid = %fid, "authenticated request");

        state.store.ensure_user(&fid).await?;
        Ok(Self { fid })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use axum::{Json, Router, http::HeaderValue, routing::get};
    use tokio::net::TcpListener;

    use super::*;

    const HEADER_WITH_KID: &str = "eyJhbGciOiJFZERTQSIsInR5cCI6IkpXVCIsImtpZCI6ImsxIn0";
    const CLAIMS: &str = "eyJzdWIiOjEwMDEsImV4cCI6NDEwMjQ0NDgwMH0";

    fn token_with_kid() -> String {
        format!("{HEADER_WITH_KID}.{CLAIMS}.c2lnbmF0dXJl")
    }

    async fn serve_empty_key_set() -> String {
        let app = Router::new().route(
            "/.well-known/jwks.json",
            get(|| async { Json(serde_json::json!({ "keys": [] })) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Serves an empty key set and counts how often it was downloaded.
    async fn serve_counted_key_set() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/.well-known/jwks.json",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "keys": [] }))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[test]
    fn bearer_token_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn domain_prefers_configuration_then_host() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_domain(None, &headers), "localhost");

        headers.insert(HOST, HeaderValue::from_static("mini.example:8443"));
        assert_eq!(token_domain(None, &headers), "mini.example:8443");
        assert_eq!(token_domain(Some("app.example"), &headers), "app.example");
        assert_eq!(token_domain(Some(" "), &headers), "mini.example:8443");
    }

    #[test]
    fn subjects_normalize_to_string_fids() {
        assert_eq!(subject_to_fid(&serde_json::json!(1001)).unwrap(), "1001");
        assert_eq!(subject_to_fid(&serde_json::json!("77")).unwrap(), "77");
        assert!(matches!(
            subject_to_fid(&serde_json::json!(null)),
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            subject_to_fid(&serde_json::json!("")),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn malformed_tokens_are_invalid_without_network() {
        let verifier = QuickAuthVerifier::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let result = verifier.verify("not-a-jwt", "app.example").await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn unknown_signing_key_is_an_invalid_token() {
        let origin = serve_empty_key_set().await;
        let verifier = QuickAuthVerifier::new(reqwest::Client::new(), origin);

        let result = verifier.verify(&token_with_kid(), "app.example").await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn unreachable_key_set_is_a_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let verifier = QuickAuthVerifier::new(reqwest::Client::new(), format!("http://{addr}"));
        let result = verifier.verify(&token_with_kid(), "app.example").await;
        assert!(matches!(result, Err(AuthError::Backend(_))));
    }

    #[tokio::test]
    async fn unknown_kids_do_not_refetch_inside_the_cooldown() {
        let (origin, hits) = serve_counted_key_set().await;
        let verifier = QuickAuthVerifier::new(reqwest::Client::new(), origin);

        for _ in 0..20 {
            let result = verifier.verify(&token_with_kid(), "app.example").await;
            assert!(matches!(result, Err(AuthError::InvalidToken(_))));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_kids_refetch_once_the_cooldown_expires() {
        let (origin, hits) = serve_counted_key_set().await;
        let mut verifier = QuickAuthVerifier::new(reqwest::Client::new(), origin);
        verifier.refresh_cooldown = Duration::ZERO;

        for _ in 0..3 {
            let result = verifier.verify(&token_with_kid(), "app.example").await;
            assert!(matches!(result, Err(AuthError::InvalidToken(_))));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
