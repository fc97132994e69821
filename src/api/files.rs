//! Per-chat file server.
//!
//! Each chat owns `<data_dir>/<chat>/uploads` (written here, mounted read-only
//! in the container) and `<data_dir>/<chat>/outputs` (written by the
//! container, served here).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, Path as UrlPath, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

use super::routes::AppState;
use super::types::UploadResponse;
use crate::session::chat_data_dir;
use crate::util::internal_error;

pub const ARCHIVE_NAME: &str = "archive";
pub const MANIFEST_NAME: &str = "manifest";

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn uploads_dir(state: &AppState, chat_id: &str) -> PathBuf {
    chat_data_dir(&state.config.data_dir, chat_id).join("uploads")
}

fn outputs_dir(state: &AppState, chat_id: &str) -> PathBuf {
    chat_data_dir(&state.config.data_dir, chat_id).join("outputs")
}

/// Validate a client-supplied relative path: plain names only, no `..`, no
/// absolute paths.
pub fn safe_relative(requested: &str) -> ApiResult<PathBuf> {
    let requested = requested.strip_prefix('/').unwrap_or(requested);
    let path = Path::new(requested);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err((StatusCode::FORBIDDEN, "Access denied".to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing filename".to_string()));
    }
    Ok(clean)
}

pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("csv") => "text/csv; charset=utf-8",
        Some("zip") => "application/zip",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

/// Relative path (with `/` separators) to hex MD5, for every file under `dir`.
fn checksum_tree(dir: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let mut manifest = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(manifest);
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let bytes = std::fs::read(entry.path())?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        manifest.insert(name, format!("{:x}", md5::compute(&bytes)));
    }
    Ok(manifest)
}

/// Zip every file under `dir`, or `None` when there is nothing to pack.
fn zip_tree(dir: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    let mut added = 0usize;
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let contents = std::fs::read(entry.path())?;
            zip.start_file(name, options)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            zip.write_all(&contents)?;
            added += 1;
        }
        zip.finish()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }
    Ok((added > 0).then_some(buffer))
}

/// `GET /api/uploads/:chat_id/manifest`
pub async fn manifest(
    State(state): State<Arc<AppState>>,
    UrlPath(chat_id): UrlPath<String>,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    let dir = uploads_dir(&state, &chat_id);
    let manifest = tokio::task::spawn_blocking(move || checksum_tree(&dir))
        .await
        .map_err(internal_error)?
        .map_err(internal_error)?;
    Ok(Json(manifest))
}

/// `GET /api/uploads/:chat_id/*path`; only the manifest is readable here.
pub async fn uploads_get(
    state: State<Arc<AppState>>,
    UrlPath((chat_id, path)): UrlPath<(String, String)>,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    if path.trim_start_matches('/') != MANIFEST_NAME {
        return Err((StatusCode::NOT_FOUND, "Not found".to_string()));
    }
    manifest(state, UrlPath(chat_id)).await
}

/// `POST /api/uploads/:chat_id/*filename`, multipart field `file`.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    UrlPath((chat_id, filename)): UrlPath<(String, String)>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let relative = safe_relative(&filename)?;
    let target = uploads_dir(&state, &chat_id).join(&relative);

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to create directory: {}", e),
                )
            })?;
        }

        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(internal_error)?;
        let mut digest = md5::Context::new();
        let mut size: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        {
            digest.consume(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(internal_error)?;
        }
        file.flush().await.map_err(internal_error)?;

        let md5 = format!("{:x}", digest.compute());
        tracing::info!(chat_id = %chat_id, file = %relative.display(), size, "Stored upload");

        return Ok(Json(UploadResponse {
            status: "success".to_string(),
            filename: relative.to_string_lossy().to_string(),
            size,
            md5,
        }));
    }

    Err((StatusCode::BAD_REQUEST, "missing file".to_string()))
}

/// `GET /files/:chat_id/*filename`; `archive` returns the zipped outputs.
pub async fn download(
    State(state): State<Arc<AppState>>,
    UrlPath((chat_id, filename)): UrlPath<(String, String)>,
) -> ApiResult<Response> {
    if filename.trim_start_matches('/') == ARCHIVE_NAME {
        return archive(&state, &chat_id).await;
    }

    let relative = safe_relative(&filename)?;
    let outputs = outputs_dir(&state, &chat_id);
    let target = outputs.join(&relative);

    if !target.exists() {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }
    // Symlinks inside outputs must not lead out of it.
    let canonical_root = tokio::fs::canonicalize(&outputs)
        .await
        .map_err(internal_error)?;
    let canonical = tokio::fs::canonicalize(&target)
        .await
        .map_err(internal_error)?;
    if !canonical.starts_with(&canonical_root) {
        return Err((StatusCode::FORBIDDEN, "Access denied".to_string()));
    }
    if !canonical.is_file() {
        return Err((StatusCode::BAD_REQUEST, "Not a file".to_string()));
    }

    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", name)
            .parse()
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Filename produces an invalid header value: {}", name),
                )
            })?,
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_path(&canonical)),
    );

    let file = tokio::fs::File::open(&canonical)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, format!("File not found: {}", e)))?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((headers, body).into_response())
}

async fn archive(state: &AppState, chat_id: &str) -> ApiResult<Response> {
    let outputs = outputs_dir(state, chat_id);
    if !outputs.exists() {
        return Err((StatusCode::NOT_FOUND, "No outputs for this chat".to_string()));
    }
    if !outputs.is_dir() {
        return Err((StatusCode::BAD_REQUEST, "Outputs is not a directory".to_string()));
    }

    let bytes = tokio::task::spawn_blocking(move || zip_tree(&outputs))
        .await
        .map_err(internal_error)?
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No files in outputs".to_string()))?;

    let disposition = format!(
        "attachment; filename=\"chat-{}-outputs.zip\"",
        crate::session::sanitize_key(chat_id)
    );
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        disposition.parse().map_err(internal_error)?,
    );

    Ok((headers, Body::from(bytes)).into_response())
}
