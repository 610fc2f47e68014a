use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    routing::{get, post},
    Json,
};
use futures_util::StreamExt;
use log::{debug, warn};
use together_collab::{ByteRange, NewUpload};
use together_core::{
    ClipId, ErrorKind, UploadReceipt, CLIP_NAME_HEADER, CLIP_SHA256_HEADER, CLIP_SIZE_HEADER,
};

use crate::{
    auth::MemberToken,
    context::ServerContext,
    errors::{ServerError, ServerResult},
    rooms::parse_code,
    serialized::ToSerialized,
    Router,
};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The declared size, from `X-Clip-Size` or else `Content-Length`.
fn declared_size(headers: &HeaderMap) -> ServerResult<u64> {
    header_str(headers, CLIP_SIZE_HEADER)
        .or_else(|| header_str(headers, header::CONTENT_LENGTH.as_str()))
        .ok_or(ServerError::BadRequest("Upload size must be declared"))?
        .trim()
        .parse()
        .map_err(|_| ServerError::BadRequest("Upload size is not a number"))
}

async fn upload_clip(
    State(context): State<ServerContext>,
    Path(code): Path<String>,
    token: MemberToken,
    headers: HeaderMap,
    body: Body,
) -> ServerResult<Json<UploadReceipt>> {
    let code = parse_code(&code)?;
    let (room, member) = context.collab.rooms.authenticate(&code, token.as_str())?;

    let size = declared_size(&headers)?;
    let name = header_str(&headers, CLIP_NAME_HEADER)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "clip".to_string());
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .filter(|c| *c != "application/octet-stream")
        .map(str::to_string);

    let mut upload = context
        .collab
        .relay
        .begin_upload(
            &room,
            NewUpload {
                member,
                size,
                name,
                content_type,
            },
        )
        .await?;

    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        // Dropping the upload deletes what was written so far
        let chunk = chunk.map_err(|e| {
            warn!("Upload body for {} failed: {}", code, e);
            ServerError::Room {
                kind: ErrorKind::Transient,
                message: "Upload connection was interrupted".to_string(),
            }
        })?;

        upload.write_chunk(&chunk).await?;
    }

    let clip = upload.finish().await?;
    debug!("Stored clip {} ({} bytes) in {}", clip.id, clip.size, code);

    Ok(Json(clip.to_serialized()))
}

async fn download_clip(
    State(context): State<ServerContext>,
    Path((code, clip)): Path<(String, String)>,
    token: MemberToken,
    headers: HeaderMap,
) -> ServerResult<Response<Body>> {
    let code = parse_code(&code)?;
    let (room, _) = context.collab.rooms.authenticate(&code, token.as_str())?;

    let clip: ClipId = clip.parse().map_err(|_| ServerError::Room {
        kind: ErrorKind::NotFound,
        message: format!("Clip {} does not exist", clip),
    })?;

    let range = header_str(&headers, header::RANGE.as_str()).and_then(ByteRange::parse);
    let download = context.collab.relay.open_download(&room, clip, range).await?;

    let status = if download.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, download.clip.content_type.as_str())
        .header(header::CONTENT_LENGTH, download.length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store")
        .header(CLIP_SHA256_HEADER, download.clip.sha256.as_str());

    if let Some(content_range) = download.content_range() {
        response = response.header(header::CONTENT_RANGE, content_range);
    }

    response
        .body(Body::from_stream(download.into_stream()))
        .map_err(|e| ServerError::Unknown(e.to_string()))
}

pub fn router() -> Router {
    Router::new()
        .route(
            "/:code/upload",
            post(upload_clip).layer(DefaultBodyLimit::disable()),
        )
        .route("/:code/videos/:clip", get(download_clip))
}
