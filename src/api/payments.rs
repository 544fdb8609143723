//! Pricing, payment intents, confirmation, wallet links and subscriptions.
//!
//! Confirmation trusts the caller's `txHash`: nothing here checks the chain.
//! An optional shared secret is the only guard until on-chain verification
//! exists.

use axum::{Json, extract::State};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::body::JsonBody,
    auth::AuthUser,
    config::{Config, non_empty},
    error::ApiError,
    pricing::{self, CURRENCY, MediaKind, PriceTable, Quality},
    state::AppState,
    store::{IntentStatus, PaymentIntent},
};

const WALLET_ADDRESS_HEX_LEN: usize = 40;

pub(crate) fn new_payment_intent(
    user_id: &str,
    kind: MediaKind,
    quality: Quality,
    amount: f64,
) -> PaymentIntent {
    PaymentIntent {
        id: format!("pi_{}", Uuid::new_v4()),
        user_id: user_id.to_string(),
        kind,
        quality,
        amount,
        currency: CURRENCY.to_string(),
        status: IntentStatus::Pending,
        created_at: Utc::now(),
    }
}

/// `0x` followed by exactly 40 hex digits.
pub(crate) fn is_valid_wallet_address(address: &str) -> bool {
    address.strip_prefix("0x").is_some_and(|hex| {
        hex.len() == WALLET_ADDRESS_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit())
    })
}

fn check_secret(config: &Config, provided: Option<&str>) -> Result<(), ApiError> {
    match config.confirm_secret.as_deref() {
        Some(expected) if provided != Some(expected) => Err(ApiError::unauthorized("invalid_secret")),
        _ => Ok(()),
    }
}

pub async fn pricing() -> Json<PriceTable> {
    Json(pricing::price_table())
}

#[derive(Debug, Deserialize)]
pub struct PayIntentRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayIntentResponse {
    intent_id: String,
    amount: f64,
    currency: &'static str,
}

pub async fn pay_intent(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<PayIntentRequest>,
) -> Result<Json<PayIntentResponse>, ApiError> {
    let account = state
        .store
        .get_user(&user.fid)
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown user"))?;

    let kind = payload.kind.as_deref().and_then(non_empty);
    let quality = payload.quality.as_deref().and_then(non_empty);
    let (Some(kind), Some(quality)) = (kind, quality) else {
        return Err(ApiError::bad_request("missing type/quality"));
    };
    let kind = MediaKind::parse(kind);
    let quality =
        Quality::parse(Some(quality)).ok_or_else(|| ApiError::bad_request("invalid quality"))?;

    let amount = pricing::price(kind, quality, &account, Utc::now().date_naive());
    if amount <= 0.0 {
        return Err(ApiError::bad_request("no payment required"));
    }

    let intent = new_payment_intent(&account.id, kind, quality, amount);
    state.store.create_payment_intent(&intent).await?;
    info!(fid = %account.id, intent = %intent.id, amount, "created payment intent");

    Ok(Json(PayIntentResponse {
        intent_id: intent.id,
        amount,
        currency: CURRENCY,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayConfirmRequest {
    intent_id: Option<String>,
    tx_hash: Option<String>,
    address: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayConfirmResponse {
    ok: bool,
    intent_id: String,
    tx_hash: Option<String>,
    linked_address: Option<String>,
}

pub async fn pay_confirm(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<PayConfirmRequest>,
) -> Result<Json<PayConfirmResponse>, ApiError> {
    let intent = match payload.intent_id.as_deref().and_then(non_empty) {
        Some(id) => state.store.get_payment_intent(id).await?,
        None => None,
    };
    let intent = intent
        .filter(|intent| intent.user_id == user.fid)
        .ok_or_else(|| ApiError::not_found("intent_not_found"))?;

    check_secret(&state.config, payload.secret.as_deref())?;

    if let Some(address) = payload
        .address
        .as_deref()
        .filter(|address| is_valid_wallet_address(address))
    {
        state.store.set_wallet_address(&user.fid, address).await?;
    }

    let newly_paid = state.store.mark_intent_paid(&intent.id).await?;
    if newly_paid {
        warn!(
            fid = %user.fid,
            intent = %intent.id,
            tx_hash = ?payload.tx_hash,
            "marked intent paid on client confirmation without on-chain verification"
        );
    }

    let linked_address = state.store.get_wallet_address(&user.fid).await?;
    Ok(Json(PayConfirmResponse {
        ok: true,
        intent_id: intent.id,
        tx_hash: payload.tx_hash,
        linked_address,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LinkWalletRequest {
    address: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LinkWalletResponse {
    ok: bool,
    address: String,
}

pub async fn link_wallet(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(payload): JsonBody<LinkWalletRequest>,
) -> Result<Json<LinkWalletResponse>, ApiError> {
    let address = payload
        .address
        .filter(|address| is_valid_wallet_address(address))
        .ok_or_else(|| ApiError::bad_request("invalid_address"))?;

    check_secret(&state.config, payload.secret.as_deref())?;

    state.store.set_wallet_address(&user.fid, &address).await?;
    info!(fid = %user.fid, "linked wallet address");
    Ok(Json(LinkWalletResponse { ok: true, address }))
}

pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.set_subscription(&user.fid).await?;
    info!(fid = %user.fid, "user subscribed");
    Ok(Json(serde_json::json!({ "ok": true })))
}
