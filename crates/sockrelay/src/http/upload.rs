use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sockrelay_frame::WorkPacket;
use sockrelay_link::LinkError;
use tracing::{info, warn};

use super::AppState;

/// Multipart field carrying the uploaded file.
const FILE_FIELD: &str = "myfile";

const UPLOAD_FAILED_BODY: &str = "something was wrong with the upload!!";

/// Why an upload was not queued.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("no `myfile` field in upload")]
    MissingFile,

    #[error("failed to store upload at {path}: {source}")]
    Store {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Enqueue(#[from] LinkError),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        warn!(error = %self, "upload rejected");
        match self {
            Self::Enqueue(err @ LinkError::QueueFull { .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{err}, retry later"),
            )
                .into_response(),
            Self::Enqueue(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
            _ => (StatusCode::BAD_REQUEST, UPLOAD_FAILED_BODY).into_response(),
        }
    }
}

/// Name an upload is stored under: `<unix-nanos>.<ext>`.
///
/// `ext` is the text after the last `.` of the original base name, or the
/// whole base name when it has no dot.
pub fn stored_file_name(original: &str, nanos: u128) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);
    let ext = base.rsplit('.').next().unwrap_or(base);
    format!("{nanos}.{ext}")
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

pub(super) async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<&'static str, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let original = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await?;

        let files_dir = &state.config().files_dir;
        let path = absolute(&files_dir.join(stored_file_name(&original, unix_nanos())));
        store(files_dir, &path, &data).await?;

        let packet = WorkPacket::new(path.to_string_lossy());
        state.sink.submit(packet)?;
        info!(original = %original, stored = %path.display(), size = data.len(), "upload queued");
        return Ok("success");
    }
    Err(UploadError::MissingFile)
}

async fn store(dir: &Path, path: &Path, data: &[u8]) -> Result<(), UploadError> {
    let to_store_error = |source| UploadError::Store {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(to_store_error)?;
    tokio::fs::write(path, data).await.map_err(to_store_error)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
