use std::sync::Arc;

use crate::{
    auth::TokenVerifier,
    cast::{CastLookup, MediaResolver},
    config::Config,
    store::Store,
    transcode::Transcoder,
    video::VideoExtractor,
};

/// Shared, cheaply clonable handles every handler needs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub verifier: Arc<dyn TokenVerifier>,
    pub resolver: MediaResolver,
    pub transcoder: Transcoder,
    pub extractor: VideoExtractor,
    /// No total timeout: proxied bodies may legitimately take minutes.
    pub media_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        verifier: Arc<dyn TokenVerifier>,
        lookup: Arc<dyn CastLookup>,
    ) -> Result<Self, reqwest::Error> {
        let media_client = reqwest::Client::builder()
            .connect_timeout(config.upstream_timeout)
            .build()?;
        let transcoder = Transcoder::new(
            config.ffmpeg_path.clone(),
            config.transfer_dir.clone(),
            config.transcode_timeout,
            config.max_concurrent_transcodes,
        );
        let extractor = VideoExtractor::new(config.yt_dlp_path.clone(), config.extract_timeout);

        Ok(Self {
            config: Arc::new(config),
            store,
            verifier,
            resolver: MediaResolver::new(lookup),
            transcoder,
            extractor,
            media_client,
        })
    }
}

/// Client for short JSON calls to collaborators (key set, cast lookup).
pub fn build_api_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()
}
