use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
};
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// JSON request body that answers with an `ApiError` instead of axum's
/// plain-text rejections. The content type is not checked and an empty body
/// reads as `{}`, so missing fields surface as the handler's own 400.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            ApiError::bad_request("invalid request body").with_details(rejection.body_text())
        })?;

        let raw: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        serde_json::from_slice(raw).map(Self).map_err(|error| {
            ApiError::bad_request("invalid JSON body").with_details(error.to_string())
        })
    }
}
