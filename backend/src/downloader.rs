use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{DownloaderConfig, non_empty},
    error::{DownloadError, DownloadErrorKind, bytes_to_mb},
    sanitize::clean_filename,
};

const SEARCH_PREFIX: &str = "ytsearch1:";
const SEARCH_ONLY_DOMAIN: &str = "spotify.com";
const AUDIO_EXTENSION: &str = "mp3";
const MAX_TOOL_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<DownloadErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
}

impl DownloadResult {
    fn completed(bytes: &[u8], stem: &str) -> Self {
        let file_size = bytes.len() as u64;
        Self {
            success: true,
            error: None,
            code: None,
            file_data: Some(STANDARD.encode(bytes)),
            filename: Some(format!("{}.{AUDIO_EXTENSION}", clean_filename(stem))),
            title: Some(stem.to_string()),
            file_size: Some(file_size),
            size_mb: Some(round_mb(file_size)),
        }
    }

    pub fn failed(error: &DownloadError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            code: Some(error.kind()),
            file_data: None,
            filename: None,
            title: None,
            file_size: None,
            size_mb: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    config: DownloaderConfig,
    running_jobs: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            running_jobs: Arc::default(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.config.scratch_root
    }

    pub fn stale_job_age(&self) -> Duration {
        self.config.stale_job_age
    }

    /// Runs one download in its own job directory. Never fails: every fault
    /// is folded into an unsuccessful [`DownloadResult`].
    pub async fn download(&self, url: Option<&str>, search_query: Option<&str>) -> DownloadResult {
        match self.try_download(url, search_query).await {
            Ok(result) => result,
            Err(error) => {
                warn!("Descarga fallida ({:?}): {error}", error.kind());
                DownloadResult::failed(&error)
            }
        }
    }

    async fn try_download(
        &self,
        url: Option<&str>,
        search_query: Option<&str>,
    ) -> Result<DownloadResult, DownloadError> {
        let target = resolve_target(url, search_query).ok_or(DownloadError::MissingInput)?;

        let job_dir = self.config.scratch_root.join(Uuid::new_v4().to_string());
        let _running = RunningJob::register(&self.running_jobs, &job_dir);

        let running_jobs = self
            .running_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        cleanup_stale_download_jobs(
            &self.config.scratch_root,
            self.config.stale_job_age,
            &running_jobs,
        )
        .await;

        tokio::fs::create_dir_all(&job_dir).await?;

        let result = self.download_into(&job_dir, &target).await;
        cleanup_download_job(&job_dir).await;
        result
    }

    async fn download_into(
        &self,
        job_dir: &Path,
        target: &str,
    ) -> Result<DownloadResult, DownloadError> {
        let args = self.build_args(job_dir, target);
        info!("Ejecutando: {} {}", self.config.program, args.join(" "));

        let output = run_yt_dlp(&self.config.program, args, self.config.timeout).await?;
        debug!(
            "Salida de {}: {}",
            self.config.program,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        let audio_path = find_audio_file(job_dir)
            .await?
            .ok_or(DownloadError::NoOutput)?;

        let size_bytes = tokio::fs::metadata(&audio_path).await?.len();
        if size_bytes > self.config.max_file_bytes {
            return Err(DownloadError::TooLarge {
                size_bytes,
                max_bytes: self.config.max_file_bytes,
            });
        }

        let bytes = tokio::fs::read(&audio_path).await?;
        let stem = audio_path
            .file_stem()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!(
            "Descarga lista: {:?} ({:.2} MB)",
            stem,
            bytes_to_mb(bytes.len() as u64)
        );
        Ok(DownloadResult::completed(&bytes, &stem))
    }

    pub fn build_args(&self, job_dir: &Path, target: &str) -> Vec<String> {
        let output_template = format!("{}/%(title)s.%(ext)s", job_dir.to_string_lossy());

        let mut args = self.config.extra_args.clone();
        args.extend(
            [
                "--extract-audio",
                "--audio-format",
                AUDIO_EXTENSION,
                "--audio-quality",
                "0",
                "--embed-thumbnail",
                "--add-metadata",
                "--no-warnings",
                "--no-playlist",
                "-o",
            ]
            .map(ToString::to_string),
        );
        args.push(output_template);
        args.push("--".to_string());
        args.push(target.to_string());
        args
    }
}

pub fn resolve_target(url: Option<&str>, search_query: Option<&str>) -> Option<String> {
    let url = url.and_then(non_empty);
    let search_query = search_query.and_then(non_empty);

    match (url, search_query) {
        (None, Some(query)) => Some(format!("{SEARCH_PREFIX}{query}")),
        (Some(url), _) if url.contains(SEARCH_ONLY_DOMAIN) => Some(format!("{SEARCH_PREFIX}{url}")),
        (Some(url), _) => Some(url.to_string()),
        (None, None) => None,
    }
}

fn round_mb(bytes: u64) -> f64 {
    (bytes_to_mb(bytes) * 100.0).round() / 100.0
}

async fn run_yt_dlp(
    program: &str,
    args: Vec<String>,
    limit: Duration,
) -> Result<std::process::Output, DownloadError> {
    let command_future = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, command_future)
        .await
        .map_err(|_| {
            warn!("{program} supero el limite de {}s", limit.as_secs_f32());
            DownloadError::Timeout
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                DownloadError::Unexpected(format!("{program} no esta instalado en el sistema"))
            } else {
                DownloadError::Unexpected(format!("No se pudo ejecutar {program}: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(DownloadError::ToolFailure(tool_error_message(
            &output.stderr,
            &output.stdout,
        )));
    }

    Ok(output)
}

fn tool_error_message(stderr: &[u8], stdout: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    let message = non_empty(&stderr).or_else(|| non_empty(&stdout)).unwrap_or("");

    message.chars().take(MAX_TOOL_ERROR_CHARS).collect()
}

async fn find_audio_file(job_dir: &Path) -> Result<Option<PathBuf>, DownloadError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    let mut candidates = Vec::new();
    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_audio = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == AUDIO_EXTENSION);
        if is_audio {
            candidates.push(path);
        }
    }
    candidates.sort();

    for candidate in candidates {
        let metadata = match tokio::fs::metadata(&candidate).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        };
        if !metadata.is_file() {
            continue;
        }

        let canonical_candidate = tokio::fs::canonicalize(&candidate).await?;
        if !canonical_candidate.starts_with(&canonical_job_dir) {
            warn!(
                "Se bloqueo un archivo fuera de la carpeta temporal esperada: {:?}",
                canonical_candidate
            );
            continue;
        }

        return Ok(Some(canonical_candidate));
    }

    Ok(None)
}

async fn cleanup_download_job(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("No se pudo limpiar carpeta temporal {:?}: {error}", job_dir);
    }
}

// Keeps a job directory out of the stale sweep while its download runs.
struct RunningJob {
    jobs: Arc<Mutex<HashSet<PathBuf>>>,
    job_dir: PathBuf,
}

impl RunningJob {
    fn register(jobs: &Arc<Mutex<HashSet<PathBuf>>>, job_dir: &Path) -> Self {
        jobs.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_dir.to_path_buf());
        Self {
            jobs: Arc::clone(jobs),
            job_dir: job_dir.to_path_buf(),
        }
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_dir);
    }
}

pub async fn cleanup_stale_download_jobs(
    scratch_root: &Path,
    max_age: Duration,
    running_jobs: &HashSet<PathBuf>,
) {
    if max_age.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(scratch_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        if running_jobs.contains(&path) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let removal = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removal {
            Ok(()) => debug!("Eliminado resto de descarga {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar {:?}: {error}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader_with(extra_args: Vec<String>) -> Downloader {
        Downloader::new(DownloaderConfig {
            extra_args,
            ..DownloaderConfig::default()
        })
    }

    #[test]
    fn search_term_without_url_becomes_search() {
        assert_eq!(
            resolve_target(None, Some("daft punk one more time")).as_deref(),
            Some("ytsearch1:daft punk one more time")
        );
        assert_eq!(
            resolve_target(Some("  "), Some("query")).as_deref(),
            Some("ytsearch1:query")
        );
    }

    #[test]
    fn streaming_catalog_links_are_searched() {
        let link = "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC";
        assert_eq!(
            resolve_target(Some(link), None),
            Some(format!("ytsearch1:{link}"))
        );
        assert_eq!(
            resolve_target(Some(link), Some("ignored")),
            Some(format!("ytsearch1:{link}"))
        );
    }

    #[test]
    fn direct_url_wins_over_search_term() {
        let link = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        assert_eq!(resolve_target(Some(link), None).as_deref(), Some(link));
        assert_eq!(resolve_target(Some(link), Some("other")).as_deref(), Some(link));
    }

    #[test]
    fn nothing_to_download() {
        assert_eq!(resolve_target(None, None), None);
        assert_eq!(resolve_target(Some(""), Some(" ")), None);
    }

    #[test]
    fn args_follow_audio_template() {
        let downloader = downloader_with(vec!["--cookies".into(), "/etc/cookies.txt".into()]);
        let job_dir = Path::new("/scratch/job-1");
        let args = downloader.build_args(job_dir, "ytsearch1:some song");

        assert_eq!(&args[..2], ["--cookies", "/etc/cookies.txt"]);
        for flag in [
            "--extract-audio",
            "--embed-thumbnail",
            "--add-metadata",
            "--no-warnings",
            "--no-playlist",
        ] {
            assert!(args.iter().any(|arg| arg == flag), "missing {flag}");
        }

        let format_at = args.iter().position(|arg| arg == "--audio-format").unwrap();
        assert_eq!(args[format_at + 1], "mp3");
        let quality_at = args.iter().position(|arg| arg == "--audio-quality").unwrap();
        assert_eq!(args[quality_at + 1], "0");
        let output_at = args.iter().position(|arg| arg == "-o").unwrap();
        assert_eq!(args[output_at + 1], "/scratch/job-1/%(title)s.%(ext)s");

        assert_eq!(&args[args.len() - 2..], ["--", "ytsearch1:some song"]);
    }

    #[test]
    fn tool_errors_prefer_stderr_and_are_capped() {
        assert_eq!(tool_error_message(b"boom\n", b"ignored"), "boom");
        assert_eq!(tool_error_message(b"  ", b"from stdout"), "from stdout");
        assert_eq!(tool_error_message(b"", b""), "");

        let long = "é".repeat(800);
        assert_eq!(
            tool_error_message(long.as_bytes(), b"").chars().count(),
            MAX_TOOL_ERROR_CHARS
        );
    }

    #[test]
    fn megabytes_round_to_two_decimals() {
        assert_eq!(round_mb(1_572_864), 1.5);
        assert_eq!(round_mb(123_456), 0.12);
        assert_eq!(round_mb(0), 0.0);
    }

    #[test]
    fn failure_serializes_without_payload() {
        let value = serde_json::to_value(DownloadResult::failed(&DownloadError::ToolFailure(
            "boom".into(),
        )))
        .unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "success": false,
                "error": "Error en yt-dlp: boom",
                "code": "TOOL_FAILURE",
            })
        );
    }

    #[tokio::test]
    async fn missing_input_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let downloader = Downloader::new(DownloaderConfig {
            program: "/nonexistent/yt-dlp".into(),
            scratch_root: scratch.clone(),
            ..DownloaderConfig::default()
        });

        let result = downloader.download(None, Some("   ")).await;

        assert!(!result.success);
        assert_eq!(result.code, Some(DownloadErrorKind::MissingInput));
        assert_eq!(result.error.as_deref(), Some("No se proporciono URL ni busqueda"));
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(DownloaderConfig {
            program: "/nonexistent/yt-dlp".into(),
            scratch_root: dir.path().to_path_buf(),
            ..DownloaderConfig::default()
        });

        let result = downloader.download(Some("https://example.com/a"), None).await;

        assert_eq!(result.code, Some(DownloadErrorKind::Unknown));
        assert!(result.error.unwrap().starts_with("Error inesperado: "));
    }

    #[tokio::test]
    async fn stale_jobs_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("old-job");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("song.mp3"), b"x").unwrap();

        let none = HashSet::new();

        cleanup_stale_download_jobs(dir.path(), Duration::from_secs(3600), &none).await;
        assert!(leftover.exists());

        cleanup_stale_download_jobs(dir.path(), Duration::ZERO, &none).await;
        assert!(leftover.exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = HashSet::from([leftover.clone()]);
        cleanup_stale_download_jobs(dir.path(), Duration::from_millis(1), &running).await;
        assert!(leftover.exists());

        cleanup_stale_download_jobs(dir.path(), Duration::from_millis(1), &none).await;
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn sweeping_missing_root_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        cleanup_stale_download_jobs(
            &dir.path().join("absent"),
            Duration::from_secs(1),
            &HashSet::new(),
        )
        .await;
    }
}
