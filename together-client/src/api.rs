use std::{io, path::Path};

use async_trait::async_trait;
use futures_util::stream;
use log::{debug, info};
use reqwest::{header, Body, Client, Response, StatusCode};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use together_core::{
    ClipInfo, ErrorBody, ErrorKind, RoomAccess, RoomCode, UploadReceipt, CLIP_NAME_HEADER,
    CLIP_SIZE_HEADER,
};

use crate::ClientError;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Reports `(received, total)` bytes while a clip downloads.
pub type Progress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Somewhere clips can be retrieved from.
#[async_trait]
pub trait ClipSource: Send + Sync {
    /// Retrieves `clip` into `staging`, resuming what is already there, and
    /// moves it to `dest` once its checksum matches.
    async fn fetch(
        &self,
        clip: &ClipInfo,
        staging: &Path,
        dest: &Path,
        progress: Progress<'_>,
    ) -> Result<(), ClientError>;
}

/// The HTTP side of a together server, for one member.
#[derive(Clone)]
pub struct RoomApi {
    http: Client,
    base: String,
    code: Option<RoomCode>,
    token: Option<String>,
}

impl RoomApi {
    pub fn new(base: &str) -> Self {
        Self {
            http: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            code: None,
            token: None,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn create_room(
        &mut self,
        password: &str,
        handle: &str,
    ) -> Result<RoomAccess, ClientError> {
        let response = self
            .http
            .post(format!("{}/rooms", self.base))
            .json(&json!({ "password": password, "displayHandle": handle }))
            .send()
            .await?;

        let access: RoomAccess = check(response).await?.json().await?;
        info!("Created room {}", access.code);

        self.remember(&access);
        Ok(access)
    }

    pub async fn join_room(
        &mut self,
        code: &RoomCode,
        password: &str,
        handle: &str,
    ) -> Result<RoomAccess, ClientError> {
        let response = self
            .http
            .post(format!("{}/rooms/{}/join", self.base, code))
            .json(&json!({ "password": password, "displayHandle": handle }))
            .send()
            .await?;

        let access: RoomAccess = check(response).await?.json().await?;
        info!("Joined room {} as member {}", access.code, access.member_id);

        self.remember(&access);
        Ok(access)
    }

    fn remember(&mut self, access: &RoomAccess) {
        self.code = Some(access.code.clone());
        self.token = Some(access.token.clone());
    }

    fn room_url(&self, path: &str) -> Result<String, ClientError> {
        let code = self.code.as_ref().ok_or(ClientError::Closed)?;
        Ok(format!("{}/rooms/{}{}", self.base, code, path))
    }

    /// Streams a local file to the room.
    pub async fn upload(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip".to_string());

        let body = stream::unfold(file, |mut file| async move {
            let mut buf = vec![0; UPLOAD_CHUNK];

            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(read) => {
                    buf.truncate(read);
                    Some((Ok::<_, io::Error>(buf), file))
                }
                Err(e) => Some((Err(e), file)),
            }
        });

        let response = self
            .http
            .post(self.room_url("/upload")?)
            .bearer_auth(self.token.as_deref().unwrap_or_default())
            .header(CLIP_NAME_HEADER, name.as_str())
            .header(CLIP_SIZE_HEADER, size)
            .body(Body::wrap_stream(body))
            .send()
            .await?;

        let receipt: UploadReceipt = check(response).await?.json().await?;
        info!("Uploaded {} as clip {}", name, receipt.asset_id);

        Ok(receipt)
    }
}

#[async_trait]
impl ClipSource for RoomApi {
    async fn fetch(
        &self,
        clip: &ClipInfo,
        staging: &Path,
        dest: &Path,
        progress: Progress<'_>,
    ) -> Result<(), ClientError> {
        let mut offset = match fs::metadata(staging).await {
            Ok(meta) if meta.len() <= clip.size => meta.len(),
            Ok(_) => 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if offset < clip.size {
            let mut request = self
                .http
                .get(self.room_url(&format!("/videos/{}", clip.id))?)
                .bearer_auth(self.token.as_deref().unwrap_or_default());

            if offset > 0 {
                debug!("Resuming clip {} at byte {}", clip.id, offset);
                request = request.header(header::RANGE, format!("bytes={}-", offset));
            }

            let mut response = check(request.send().await?).await?;

            if response.status() != StatusCode::PARTIAL_CONTENT {
                offset = 0;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(offset > 0)
                .truncate(offset == 0)
                .open(staging)
                .await?;

            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                offset += chunk.len() as u64;
                progress(offset, clip.size);
            }

            file.flush().await?;
        }

        let actual = sha256_of(staging).await?;

        if actual != clip.sha256 {
            fs::remove_file(staging).await?;

            return Err(ClientError::Integrity {
                expected: clip.sha256.clone(),
                actual,
            });
        }

        fs::rename(staging, dest).await?;
        Ok(())
    }
}

/// Turns error responses into [ClientError::Server].
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.json::<ErrorBody>().await.unwrap_or_else(|_| ErrorBody {
        kind: kind_of(status),
        message: status.to_string(),
    });

    Err(ClientError::Server {
        kind: body.kind,
        message: body.message,
    })
}

fn kind_of(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ErrorKind::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::TooLarge,
        StatusCode::CONFLICT | StatusCode::RANGE_NOT_SATISFIABLE => ErrorKind::Conflict,
        StatusCode::BAD_REQUEST => ErrorKind::Malformed,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Transient,
        _ => ErrorKind::Internal,
    }
}

pub async fn sha256_of(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0; UPLOAD_CHUNK];

    loop {
        let read = file.read(&mut buf).await?;

        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::sha256_of;

    #[tokio::test]
    async fn checksums_match_the_server_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert_eq!(
            sha256_of(Path::new(&path)).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
