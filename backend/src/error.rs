use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadErrorKind {
    MissingInput,
    ToolFailure,
    NoOutput,
    TooLarge,
    Timeout,
    Unknown,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("No se proporciono URL ni busqueda")]
    MissingInput,

    #[error("Error en yt-dlp: {0}")]
    ToolFailure(String),

    #[error("No se encontro archivo MP3 despues de la descarga")]
    NoOutput,

    #[error("El archivo es muy grande ({:.1}MB). Maximo: {}MB", size_in_mb(.size_bytes), whole_mb(.max_bytes))]
    TooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("La descarga tardo demasiado (timeout)")]
    Timeout,

    #[error("Error inesperado: {0}")]
    Unexpected(String),
}

impl DownloadError {
    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            Self::MissingInput => DownloadErrorKind::MissingInput,
            Self::ToolFailure(_) => DownloadErrorKind::ToolFailure,
            Self::NoOutput => DownloadErrorKind::NoOutput,
            Self::TooLarge { .. } => DownloadErrorKind::TooLarge,
            Self::Timeout => DownloadErrorKind::Timeout,
            Self::Unexpected(_) => DownloadErrorKind::Unknown,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        Self::Unexpected(error.to_string())
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

fn size_in_mb(bytes: &u64) -> f64 {
    bytes_to_mb(*bytes)
}

fn whole_mb(bytes: &u64) -> u64 {
    bytes / 1_048_576
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Origen invalido en ALLOWED_ORIGINS: {0}. Usa valores tipo https://dominio.com")]
    InvalidOrigin(String),

    #[error("No se pudo crear la carpeta temporal de descargas: {0}")]
    ScratchDir(#[source] std::io::Error),

    #[error("No se pudo iniciar el puerto {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error del servidor HTTP: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
        });

        (self.status, body).into_response()
    }
}
