use std::{path::PathBuf, time::Duration};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_URL: &str = "sqlite://app.db";
const DEFAULT_NEYNAR_API_BASE: &str = "https://api.neynar.com";
const DEFAULT_QUICK_AUTH_ORIGIN: &str = "https://auth.farcaster.xyz";
const DEFAULT_UPSTREAM_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_EXTRACT_TIMEOUT_SECONDS: u64 = 120;
const DEFAULT_TRANSCODE_TIMEOUT_SECONDS: u64 = 15 * 60;
const DEFAULT_MAX_CONCURRENT_TRANSCODES: usize = 2;

/// Every environment knob the service reads, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Credential for the cast lookup API. Hash resolution fails without it.
    pub neynar_api_key: Option<String>,
    pub neynar_api_base: String,
    /// Shared secret checked by payment confirmation and wallet linking.
    pub confirm_secret: Option<String>,
    /// Domain identity tokens must be bound to; falls back to the `Host`
    /// header when unset.
    pub miniapp_domain: Option<String>,
    pub quick_auth_origin: String,
    pub transfer_dir: PathBuf,
    pub ffmpeg_path: String,
    pub yt_dlp_path: String,
    pub allowed_origins: Vec<String>,
    pub upstream_timeout: Duration,
    pub extract_timeout: Duration,
    pub transcode_timeout: Duration,
    pub max_concurrent_transcodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            neynar_api_key: None,
            neynar_api_base: DEFAULT_NEYNAR_API_BASE.to_string(),
            confirm_secret: None,
            miniapp_domain: None,
            quick_auth_origin: DEFAULT_QUICK_AUTH_ORIGIN.to_string(),
            transfer_dir: std::env::temp_dir(),
            ffmpeg_path: "ffmpeg".to_string(),
            yt_dlp_path: "yt-dlp".to_string(),
            allowed_origins: Vec::new(),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECONDS),
            extract_timeout: Duration::from_secs(DEFAULT_EXTRACT_TIMEOUT_SECONDS),
            transcode_timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECONDS),
            max_concurrent_transcodes: DEFAULT_MAX_CONCURRENT_TRANSCODES,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: resolve_bind_addr(),
            database_url: read_string_env("DATABASE_URL").unwrap_or(defaults.database_url),
            neynar_api_key: read_string_env("NEYNAR_API_KEY"),
            neynar_api_base: read_string_env("NEYNAR_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.neynar_api_base),
            confirm_secret: read_string_env("WC_SECRET"),
            miniapp_domain: read_string_env("MINIAPP_DOMAIN"),
            quick_auth_origin: read_string_env("QUICK_AUTH_ORIGIN")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.quick_auth_origin),
            transfer_dir: read_string_env("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transfer_dir),
            ffmpeg_path: read_string_env("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            yt_dlp_path: read_string_env("YT_DLP_PATH").unwrap_or(defaults.yt_dlp_path),
            allowed_origins: read_list_env("ALLOWED_ORIGINS"),
            upstream_timeout: read_seconds_env("UPSTREAM_TIMEOUT_SECONDS")
                .unwrap_or(defaults.upstream_timeout),
            extract_timeout: read_seconds_env("EXTRACT_TIMEOUT_SECONDS")
                .unwrap_or(defaults.extract_timeout),
            transcode_timeout: read_seconds_env("TRANSCODE_TIMEOUT_SECONDS")
                .unwrap_or(defaults.transcode_timeout),
            max_concurrent_transcodes: read_usize_env("MAX_CONCURRENT_TRANSCODES")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_transcodes),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_seconds_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
