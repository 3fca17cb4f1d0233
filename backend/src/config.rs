use std::{collections::HashSet, path::PathBuf, time::Duration};

use tracing::warn;
use url::Url;

use crate::error::StartupError;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;
const STALE_JOB_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub max_concurrent_downloads: usize,
    pub allowed_origins: Option<HashSet<String>>,
    pub downloader: DownloaderConfig,
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub program: String,
    pub extra_args: Vec<String>,
    pub scratch_root: PathBuf,
    pub timeout: Duration,
    pub max_file_bytes: u64,
    pub stale_job_age: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_YT_DLP_BIN.to_string(),
            extra_args: Vec::new(),
            scratch_root: std::env::temp_dir().join("music"),
            timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            stale_job_age: Duration::from_secs(DEFAULT_STALE_JOB_SECONDS),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, StartupError> {
        let defaults = DownloaderConfig::default();

        let mut downloader = DownloaderConfig {
            program: std::env::var("YTDLP_BIN")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or(defaults.program),
            extra_args: std::env::var("YTDLP_EXTRA_ARGS")
                .map(|value| value.split_whitespace().map(ToString::to_string).collect())
                .unwrap_or_default(),
            scratch_root: std::env::var("SCRATCH_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or(defaults.scratch_root),
            timeout: read_u64_env("DOWNLOAD_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_file_bytes: read_u64_env("MAX_FILE_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_file_bytes),
            stale_job_age: read_u64_env("STALE_JOB_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_job_age),
        };
        downloader.stale_job_age =
            stale_job_age_floor(downloader.stale_job_age, downloader.timeout);

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            allowed_origins: read_allowed_origins()?,
            downloader,
        })
    }
}

// A sweep younger than the download timeout could remove a running job's directory.
fn stale_job_age_floor(stale_job_age: Duration, timeout: Duration) -> Duration {
    let floor = timeout + STALE_JOB_MARGIN;
    if stale_job_age.is_zero() || stale_job_age >= floor {
        return stale_job_age;
    }

    warn!(
        "STALE_JOB_SECONDS={}s es menor que el timeout de descarga. Se usaran {}s.",
        stale_job_age.as_secs(),
        floor.as_secs()
    );
    floor
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn read_allowed_origins() -> Result<Option<HashSet<String>>, StartupError> {
    let Some(raw) = std::env::var("ALLOWED_ORIGINS").ok() else {
        return Ok(None);
    };

    parse_allowed_origins(&raw)
}

fn parse_allowed_origins(raw: &str) -> Result<Option<HashSet<String>>, StartupError> {
    let origins = raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| StartupError::InvalidOrigin(origin.to_string()))
        })
        .collect::<Result<HashSet<_>, _>>()?;

    if origins.is_empty() {
        warn!("ALLOWED_ORIGINS esta vacio. No se habilitara CORS.");
        return Ok(None);
    }

    Ok(Some(origins))
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
    if !bare || !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    Some(parsed.origin().ascii_serialization())
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
