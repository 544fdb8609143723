//! Response builders for the three delivery strategies: redirect, proxied
//! remote bytes, and locally produced bytes (temp file or subprocess).

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt, stream};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use url::Url;

use crate::{error::ApiError, pricing::MediaKind, video::VideoDownload};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

/// Owns a file on disk and deletes it when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temporary file {:?}", self.path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove temporary file {:?}: {error}", self.path),
        }
    }
}

/// Keep `guard` alive exactly as long as `inner`. The body is dropped both
/// when it finishes and when the client goes away, so either way releases
/// the guard.
pub fn hold<S, G>(inner: S, guard: G) -> impl Stream<Item = S::Item> + Send + 'static
where
    S: Stream + Send + 'static,
    G: Send + 'static,
{
    inner.map(move |item| {
        let _guard = &guard;
        item
    })
}

pub fn redirect_response(location: &str) -> Result<Response, ApiError> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| ApiError::internal("invalid redirect location"))?;
    Ok((StatusCode::FOUND, [(LOCATION, value)]).into_response())
}

/// Stream a remote resource byte-for-byte, keeping its content type.
pub async fn proxy_response(
    client: &reqwest::Client,
    url: &str,
    kind: MediaKind,
) -> Result<Response, ApiError> {
    let upstream = client.get(url).send().await?.error_for_status()?;

    let fallback_type = if kind == MediaKind::Image {
        "image/*"
    } else {
        "application/octet-stream"
    };
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(fallback_type));
    let filename = filename_from_url(url).unwrap_or_else(|| {
        if kind == MediaKind::Image { "image" } else { "file" }.to_string()
    });

    let mut headers = attachment_headers(&filename)?;
    headers.insert(CONTENT_TYPE, content_type);
    if let Some(length) = upstream.content_length() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    debug!(url, filename, "proxying remote media");
    Ok((headers, Body::from_stream(upstream.bytes_stream())).into_response())
}

/// Stream a local file, deleting it once the response body is dropped.
pub async fn file_response(
    file: TempFile,
    filename: &str,
    content_type: &'static str,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(file.path())
        .await
        .map_err(|error| ApiError::server_error(format!("cannot stat output: {error}"), None))?;
    let handle = tokio::fs::File::open(file.path())
        .await
        .map_err(|error| ApiError::server_error(format!("cannot open output: {error}"), None))?;

    let mut headers = attachment_headers(filename)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));

    let body = Body::from_stream(hold(ReaderStream::new(handle), file));
    Ok((headers, body).into_response())
}

/// Stream a yt-dlp child's stdout. Waits for the first chunk so a process
/// that dies immediately becomes an error instead of an empty download.
pub async fn process_response(
    download: VideoDownload,
    filename: &str,
    content_type: &'static str,
) -> Result<Response, ApiError> {
    let VideoDownload { mut child, stdout } = download;
    let mut chunks = ReaderStream::new(stdout);

    let first = match chunks.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(error)) => {
            return Err(ApiError::server_error(
                format!("reading yt-dlp output failed: {error}"),
                None,
            ));
        }
        None => {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(error) => error.to_string(),
            };
            return Err(ApiError::server_error(
                format!("yt-dlp produced no data ({status})"),
                None,
            ));
        }
    };

    let mut headers = attachment_headers(filename)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    let body = stream::once(async move { Ok::<_, std::io::Error>(first) }).chain(chunks);
    Ok((headers, Body::from_stream(hold(body, child))).into_response())
}

fn attachment_headers(filename: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("could not build the download header"))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("could not build the file name header"))?,
    );
    Ok(headers)
}

/// Last non-empty path segment, percent-decoded.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    let decoded = urlencoding::decode(segment)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
