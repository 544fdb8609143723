//! Cast media lookup and resolution of download references to concrete URLs.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::pricing::MediaKind;

const IMAGE_EXTENSIONS: [&str; 7] = [".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".tiff"];
const VIDEO_EXTENSIONS: [&str; 6] = [".mp4", ".webm", ".mov", ".m4v", ".mkv", ".m3u8"];

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Missing NEYNAR_API_KEY to resolve cast hash")]
    MissingCredential,

    #[error("cast lookup failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("no media found in cast")]
    NoMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Embed,
    Frame,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastMedia {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub source: MediaSource,
}

/// Lists the media referenced by a cast.
#[async_trait]
pub trait CastLookup: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn list_media(&self, hash: &str) -> Result<Vec<CastMedia>, LookupError>;
}

pub struct NeynarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl NeynarClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CastLookup for NeynarClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn list_media(&self, hash: &str) -> Result<Vec<CastMedia>, LookupError> {
        let api_key = self.api_key.as_deref().ok_or(LookupError::MissingCredential)?;

        let url = format!(
            "{}/v2/farcaster/cast?identifier={}&type=hash",
            self.base_url,
            urlencoding::encode(hash)
        );
        let payload = self
            .client
            .get(url)
            .header("accept", "application/json")
            .header("api_key", api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        let media = collect_cast_media(&payload);
        debug!(hash, found = media.len(), "cast lookup finished");
        Ok(media)
    }
}

/// Pull candidate media out of a lookup response, first URL occurrence wins.
pub fn collect_cast_media(payload: &Value) -> Vec<CastMedia> {
    let cast = payload.get("cast").unwrap_or(payload);
    let mut seen = HashSet::new();
    let mut media = Vec::new();

    let mut push = |value: Option<&Value>, source: MediaSource| {
        if let Some(url) = value.and_then(Value::as_str)
            && !url.is_empty()
            && seen.insert(url.to_string())
        {
            media.push(CastMedia {
                url: url.to_string(),
                kind: detect_type_from_url(url),
                source,
            });
        }
    };

    if let Some(embeds) = cast.get("embeds").and_then(Value::as_array) {
        for embed in embeds {
            let link = ["url", "uri", "src"]
                .iter()
                .find_map(|key| embed.get(*key).filter(|value| is_truthy(value)));
            push(link, MediaSource::Embed);
        }
    }

    push(
        cast.get("frames").and_then(|frames| frames.get("image")),
        MediaSource::Frame,
    );

    if let Some(attachments) = cast.get("attachments").and_then(Value::as_array) {
        for attachment in attachments {
            push(attachment.get("image"), MediaSource::Attachment);
            push(attachment.get("video"), MediaSource::Attachment);
            push(attachment.get("url"), MediaSource::Attachment);
        }
    }

    media
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// Extension sniffing on the whole URL string. Images win over videos.
pub fn detect_type_from_url(url: &str) -> MediaKind {
    let lower = url.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
        MediaKind::Image
    } else if VIDEO_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

pub fn is_http_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

pub fn is_hls_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|url| url.path().to_ascii_lowercase().ends_with(".m3u8"))
}

/// Turns a URL-or-hash reference into a URL that can be fetched.
#[derive(Clone)]
pub struct MediaResolver {
    lookup: Arc<dyn CastLookup>,
}

impl MediaResolver {
    pub fn new(lookup: Arc<dyn CastLookup>) -> Self {
        Self { lookup }
    }

    pub fn lookup(&self) -> &dyn CastLookup {
        self.lookup.as_ref()
    }

    pub async fn resolve(&self, input: &str, preferred: MediaKind) -> Result<String, ResolveError> {
        if is_http_url(input) {
            return Ok(input.to_string());
        }

        let media = self.lookup.list_media(input).await?;
        select_media(&media, preferred)
            .map(|item| item.url.clone())
            .ok_or(ResolveError::NoMedia)
    }
}

fn select_media(media: &[CastMedia], preferred: MediaKind) -> Option<&CastMedia> {
    let wanted = match preferred {
        MediaKind::Image | MediaKind::Video => media.iter().find(|item| item.kind == preferred),
        MediaKind::Other => None,
    };
    wanted.or_else(|| media.first())
}
