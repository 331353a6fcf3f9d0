use std::path::{Component, Path, PathBuf};

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::AppState;

const INDEX_FILE: &str = "index.html";

/// A name with exactly one normal path component.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

/// `root` joined with `relative`, or `None` if `relative` escapes `root`.
fn contained(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("mp4") => "video/mp4",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn read_file(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => tokio::fs::read(path).await.ok(),
        _ => None,
    }
}

pub(super) async fn download(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if !is_plain_name(&name) {
        debug!(name = %name, "refusing download outside files directory");
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = state.config().files_dir.join(&name);
    let Some(data) = read_file(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let disposition = format!("attachment; filename={name:?}");
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response()
}

pub(super) async fn index(State(state): State<AppState>) -> Response {
    serve_static(&state, "").await
}

pub(super) async fn index_path(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    serve_static(&state, &path).await
}

/// Serve `relative` from the static root, falling back to the index page.
async fn serve_static(state: &AppState, relative: &str) -> Response {
    let root = &state.config().static_dir;
    if let Some(path) = contained(root, relative).filter(|_| !relative.is_empty()) {
        if let Some(data) = read_file(&path).await {
            return ([(header::CONTENT_TYPE, content_type(&path))], data).into_response();
        }
    }

    let index = root.join(INDEX_FILE);
    match read_file(&index).await {
        Some(data) => ([(header::CONTENT_TYPE, content_type(&index))], data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
