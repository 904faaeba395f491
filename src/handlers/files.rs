//! Upload and download handlers.

use axum::{
    body::Body,
    extract::{multipart::MultipartError, multipart::MultipartRejection, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::{Bytes, BytesMut};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

use crate::auth::AuthClaims;
use crate::errors::{ApiError, ErrorBody};
use crate::service::{Upload, UploadResponse};
use crate::storage::backend::{FileMetadata, StoredFile};
use crate::validation::OCTET_STREAM;
use crate::AppState;

/// Name of the multipart field carrying the file.
pub const FILE_FIELD: &str = "file";

/// Allowance for multipart framing on top of the file size ceiling.
pub const MULTIPART_SLACK: u64 = 64 * 1024;

/// The uploaded part as received.
struct FilePart {
    file_name: String,
    content_type: String,
    data: Bytes,
}

/// `POST /api/v1/upload` -- store the multipart `file` field.
#[utoipa::path(
    post,
    path = "/api/v1/upload",
    tag = "Files",
    operation_id = "UploadFile",
    description = "Multipart form upload; the file goes in the `file` field.",
    responses(
        (status = 200, description = "File stored", body = UploadResponse),
        (status = 400, description = "Invalid request, type, or size", body = ErrorBody),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody)
    )
)]
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<AuthClaims>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let max = state.service.validator().max_file_size();
    if let Some(len) = content_length(&headers) {
        if len > max.saturating_add(MULTIPART_SLACK) {
            debug!("Rejecting upload with Content-Length {} (max {})", len, max);
            return Err(ApiError::FileTooLarge);
        }
    }

    let mut multipart =
        multipart.map_err(|e| ApiError::invalid_request(format!("Invalid multipart request: {e}")))?;
    let part = read_file_part(&mut multipart, max).await?;

    let subject = claims.as_ref().map(|Extension(c)| c.subject_id.as_str());
    let upload = Upload {
        file_name: part.file_name,
        declared_size: part.data.len() as u64,
        declared_content_type: part.content_type,
        content: Cursor::new(part.data),
    };
    let response = state.service.upload(subject, upload).await?;
    Ok(Json(response))
}

/// Pull the `file` field out of the form, skipping any other fields.
async fn read_file_part(multipart: &mut Multipart, max: u64) -> Result<FilePart, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if (data.len() + chunk.len()) as u64 > max {
                return Err(ApiError::FileTooLarge);
            }
            data.extend_from_slice(&chunk);
        }

        return Ok(FilePart {
            file_name,
            content_type,
            data: data.freeze(),
        });
    }
    Err(ApiError::invalid_request("No file provided"))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::FileTooLarge
    } else {
        ApiError::invalid_request(format!("Invalid multipart body: {}", err.body_text()))
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `GET /api/v1/files/{id}` (and `/files/{id}`) -- stream the file back, or
/// its metadata when the client accepts JSON.
#[utoipa::path(
    get,
    path = "/api/v1/files/{id}",
    tag = "Files",
    operation_id = "DownloadFile",
    params(
        ("id" = String, Path, description = "File id returned by the upload"),
    ),
    responses(
        (status = 200, description = "File content, or metadata with `Accept: application/json`", body = FileMetadata),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
        (status = 404, description = "File not found", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody)
    )
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<AuthClaims>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let subject = claims.as_ref().map(|Extension(c)| c.subject_id.as_str());

    if wants_json(&headers) {
        let metadata = state.service.metadata(subject, &id).await?;
        return Ok(Json(metadata).into_response());
    }

    let StoredFile { content, metadata } = state.service.download(subject, &id).await?;
    let expected = metadata.size;
    let data = tokio::task::spawn_blocking(move || read_exact_size(content, expected))
        .await
        .map_err(|e| anyhow::anyhow!("download task failed: {e}"))??;

    let mut response = Response::new(Body::from(data));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&metadata.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&metadata.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// `GET /api/v1/files/` with no id.
pub async fn missing_file_id() -> ApiError {
    ApiError::invalid_request("File ID is required")
}

/// Read the stored content and confirm it still has the recorded length.
fn read_exact_size(mut content: Box<dyn Read + Send>, expected: u64) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
    content.read_to_end(&mut data)?;
    if data.len() as u64 != expected {
        anyhow::bail!(
            "stored content is {} bytes but metadata records {}",
            data.len(),
            expected
        );
    }
    Ok(data)
}

/// `true` if the Accept header lists `application/json`.
fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|item| {
            item.split(';')
                .next()
                .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
        })
}

/// Attachment header carrying an ASCII fallback and the exact UTF-8 name.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(name, NON_ALPHANUMERIC)
    )
}
