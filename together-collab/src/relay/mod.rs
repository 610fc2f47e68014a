mod asset;
mod quota;
mod range;

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::{stream, Stream};
use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    runtime::Handle,
};
use together_core::{ClipId, ClipInfo, Config, MemberId, RoomCode};

use crate::{rooms::Room, RoomError};

pub use asset::*;
pub use quota::*;
pub use range::*;

/// Moves clip files in and out of room storage.
#[derive(Debug, Clone)]
pub struct Relay {
    root: PathBuf,
    max_file_size: u64,
    quota: Arc<StorageQuota>,
}

/// An upload about to start.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub member: MemberId,
    pub size: u64,
    pub name: String,
    /// Guessed from the name when absent
    pub content_type: Option<String>,
}

/// An upload in progress. Dropping it before [UploadHandle::finish] succeeds
/// deletes the partial file and marks the clip as failed.
pub struct UploadHandle {
    room: Arc<Room>,
    clip: ClipId,
    path: PathBuf,
    file: Option<File>,
    expected: u64,
    received: u64,
    hasher: Sha256,
    quota: Arc<StorageQuota>,
    finished: bool,
}

/// An opened clip, ready to be streamed.
pub struct Download {
    pub clip: ClipInfo,
    /// Size of the whole file
    pub total: u64,
    pub start: u64,
    /// Number of bytes that will be sent
    pub length: u64,
    /// Whether this serves a byte range rather than the whole file
    pub partial: bool,
    file: File,
}

impl Relay {
    const CHUNK_SIZE: u64 = 64 * 1024;

    pub fn new(config: &Config) -> Self {
        Self {
            root: config.upload_dir.clone(),
            max_file_size: config.max_file_size,
            quota: Arc::new(StorageQuota::new(config.max_storage)),
        }
    }

    pub fn room_dir(&self, code: &RoomCode) -> PathBuf {
        self.root.join(code.as_str())
    }

    pub fn quota(&self) -> &StorageQuota {
        &self.quota
    }

    /// Registers an upload and opens its file. The clip stays invisible to
    /// downloads until the upload finishes.
    pub async fn begin_upload(
        &self,
        room: &Arc<Room>,
        upload: NewUpload,
    ) -> Result<UploadHandle, RoomError> {
        if upload.size == 0 {
            return Err(RoomError::EmptyUpload);
        }

        if upload.size > self.max_file_size {
            return Err(RoomError::TooLarge {
                size: upload.size,
                limit: self.max_file_size,
            });
        }

        if !room.is_member(upload.member) {
            return Err(RoomError::MemberNotFound);
        }

        self.quota.reserve(upload.size)?;

        let clip = ClipId::new();
        let dir = self.room_dir(room.code());
        let path = dir.join(clip.to_string());

        let file = match create_file(&dir, &path).await {
            Ok(file) => file,
            Err(error) => {
                self.quota.release(upload.size);
                return Err(error.into());
            }
        };

        let content_type = upload
            .content_type
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| content_type_for(&upload.name).to_string());

        let asset = ClipAsset {
            id: clip,
            name: upload.name,
            size: upload.size,
            content_type,
            contributed_by: upload.member,
            path: path.clone(),
            status: AssetStatus::Uploading,
        };

        // From here on the handle owns the cleanup
        let handle = UploadHandle {
            room: room.clone(),
            clip,
            path,
            file: Some(file),
            expected: upload.size,
            received: 0,
            hasher: Sha256::new(),
            quota: self.quota.clone(),
            finished: false,
        };

        room.register_clip(asset)?;

        Ok(handle)
    }

    /// Opens a finished clip, optionally limited to a byte range.
    pub async fn open_download(
        &self,
        room: &Room,
        clip: ClipId,
        range: Option<ByteRange>,
    ) -> Result<Download, RoomError> {
        let asset = room.clip(clip)?;
        let info = asset.info().ok_or(RoomError::ClipNotFound(clip))?;

        let mut file = File::open(&asset.path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RoomError::ClipNotFound(clip),
            _ => e.into(),
        })?;
        let total = file.metadata().await?.len();

        let (start, length, partial) = match range {
            None => (0, total, false),
            Some(range) => {
                let (first, last) = range
                    .resolve(total)
                    .ok_or(RoomError::RangeNotSatisfiable { size: total })?;

                (first, last - first + 1, true)
            }
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        Ok(Download {
            clip: info,
            total,
            start,
            length,
            partial,
            file,
        })
    }

    /// Deletes every file of a room and gives its space back.
    pub async fn purge_room(self, code: RoomCode, stored: u64) {
        let dir = self.room_dir(&code);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Deleted files of room {}", code),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete files of room {}: {}", code, e),
        }

        self.quota.release(stored);
    }
}

async fn create_file(dir: &Path, path: &Path) -> io::Result<File> {
    fs::create_dir_all(dir).await?;
    File::create(path).await
}

impl UploadHandle {
    pub fn clip(&self) -> ClipId {
        self.clip
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Appends a chunk. Fails if the chunk would exceed the declared size.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), RoomError> {
        let received = self.received + chunk.len() as u64;

        if received > self.expected {
            return Err(RoomError::Overflow(self.expected));
        }

        let file = self.file.as_mut().ok_or(RoomError::ClipNotFound(self.clip))?;
        file.write_all(chunk).await?;

        self.hasher.update(chunk);
        self.received = received;

        Ok(())
    }

    /// Completes the upload once every declared byte arrived, making the clip
    /// downloadable and announcing it to the room.
    pub async fn finish(mut self) -> Result<ClipInfo, RoomError> {
        if self.received != self.expected {
            return Err(RoomError::Incomplete {
                received: self.received,
                expected: self.expected,
            });
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let sha256 = format!("{:x}", std::mem::take(&mut self.hasher).finalize());
        let info = self.room.complete_clip(self.clip, sha256)?;

        self.finished = true;
        Ok(info)
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        drop(self.file.take());

        let path = std::mem::take(&mut self.path);

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { remove_partial(&path).await });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    log_removal_error(&path, e);
                }
            }
        }

        self.room.fail_clip(self.clip);
        self.quota.release(self.expected);

        info!(
            "Upload of clip {} to {} aborted after {} of {} bytes",
            self.clip,
            self.room.code(),
            self.received,
            self.expected
        );
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        log_removal_error(path, e);
    }
}

fn log_removal_error(path: &Path, e: io::Error) {
    if e.kind() != io::ErrorKind::NotFound {
        warn!("Could not delete partial upload {:?}: {}", path, e);
    }
}

impl Download {
    /// The `Content-Range` value for partial responses.
    pub fn content_range(&self) -> Option<String> {
        self.partial.then(|| {
            format!(
                "bytes {}-{}/{}",
                self.start,
                self.start + self.length - 1,
                self.total
            )
        })
    }

    /// Streams the selected bytes in chunks. Dropping the stream closes the file.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
        stream::unfold((self.file, self.length), |(mut file, remaining)| async move {
            if remaining == 0 {
                return None;
            }

            let mut buf = vec![0; remaining.min(Relay::CHUNK_SIZE) as usize];

            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(read) => {
                    buf.truncate(read);
                    Some((Ok(buf), (file, remaining - read as u64)))
                }
                Err(e) => Some((Err(e), (file, 0))),
            }
        })
    }
}

/// Guesses a content type from a file name.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("flv") => "video/x-flv",
        Some("wmv") => "video/x-ms-wmv",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use futures_util::StreamExt;
    use sha2::{Digest, Sha256};
    use tokio::{
        sync::mpsc,
        time::{sleep, timeout},
    };
    use together_core::{ClipId, Config, ErrorKind, MemberId, RoomCode, ServerMessage};

    use super::{content_type_for, ByteRange, NewUpload, Relay};
    use crate::rooms::{Outbound, Room};

    struct Fixture {
        _dir: tempfile::TempDir,
        relay: Relay,
        room: Arc<Room>,
        member: MemberId,
    }

    fn fixture(max_storage: Option<u64>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            upload_dir: dir.path().to_path_buf(),
            max_file_size: 1000,
            max_storage,
            ..Default::default()
        };

        let relay = Relay::new(&config);
        let room = Room::new(RoomCode::generate(), String::new(), Arc::new(config));
        let member = room.add_member("uploader".into()).unwrap().id;

        Fixture {
            _dir: dir,
            relay,
            room,
            member,
        }
    }

    fn upload(member: MemberId, size: u64) -> NewUpload {
        NewUpload {
            member,
            size,
            name: "holiday.MKV".into(),
            content_type: None,
        }
    }

    async fn collect(
        relay: &Relay,
        room: &Room,
        clip: ClipId,
        range: Option<ByteRange>,
    ) -> Vec<u8> {
        let download = relay.open_download(room, clip, range).await.unwrap();
        let mut body = Vec::new();
        let mut stream = Box::pin(download.into_stream());

        while let Some(chunk) = stream.next().await {
            body.extend(chunk.unwrap());
        }

        body
    }

    #[tokio::test]
    async fn finished_uploads_can_be_downloaded() {
        let f = fixture(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = f.room.attach(f.member, tx).unwrap();

        let data: Vec<u8> = (0..200u8).collect();
        let mut handle = f.relay.begin_upload(&f.room, upload(f.member, 200)).await.unwrap();
        let clip = handle.clip();

        // Not visible while uploading
        assert!(f.relay.open_download(&f.room, clip, None).await.is_err());

        for chunk in data.chunks(64) {
            handle.write_chunk(chunk).await.unwrap();
        }
        let info = handle.finish().await.unwrap();

        assert_eq!(info.content_type, "video/x-matroska");
        assert_eq!(info.sha256, format!("{:x}", Sha256::digest(&data)));

        assert_eq!(collect(&f.relay, &f.room, clip, None).await, data);
        assert_eq!(
            collect(&f.relay, &f.room, clip, ByteRange::parse("bytes=10-19")).await,
            data[10..20].to_vec()
        );

        let announced = std::iter::from_fn(|| rx.try_recv().ok()).any(|o| {
            matches!(o, Outbound::Message(ServerMessage::VideoUploaded { clip: c }) if c.id == clip)
        });
        assert!(announced);
    }

    #[tokio::test]
    async fn dropped_uploads_leave_nothing_behind() {
        let f = fixture(Some(1000));

        let mut handle = f.relay.begin_upload(&f.room, upload(f.member, 100)).await.unwrap();
        let clip = handle.clip();
        let path = f.relay.room_dir(f.room.code()).join(clip.to_string());

        handle.write_chunk(&[7; 60]).await.unwrap();
        assert!(path.exists());

        drop(handle);
        assert_eq!(f.relay.quota().used(), 0);

        // The partial file is deleted in the background
        timeout(Duration::from_secs(5), async {
            while path.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let err = f.relay.open_download(&f.room, clip, None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn short_uploads_fail_to_finish() {
        let f = fixture(None);

        let mut handle = f.relay.begin_upload(&f.room, upload(f.member, 10)).await.unwrap();
        handle.write_chunk(&[1; 4]).await.unwrap();

        let err = handle.finish().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(f.room.clips().is_empty());
    }

    #[tokio::test]
    async fn sizes_are_enforced() {
        let f = fixture(Some(150));

        let err = f
            .relay
            .begin_upload(&f.room, upload(f.member, 1001))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::TooLarge);

        let mut handle = f.relay.begin_upload(&f.room, upload(f.member, 100)).await.unwrap();
        assert!(handle.write_chunk(&[0; 101]).await.is_err());

        // The quota is already half taken by the open upload
        let err = f
            .relay
            .begin_upload(&f.room, upload(f.member, 100))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::TooLarge);
    }

    #[tokio::test]
    async fn unsatisfiable_ranges_are_refused() {
        let f = fixture(None);

        let mut handle = f.relay.begin_upload(&f.room, upload(f.member, 10)).await.unwrap();
        handle.write_chunk(&[1; 10]).await.unwrap();
        let clip = handle.finish().await.unwrap().id;

        let err = f
            .relay
            .open_download(&f.room, clip, ByteRange::parse("bytes=10-"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, crate::RoomError::RangeNotSatisfiable { size: 10 }));
    }

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type_for("a.mp4"), "video/mp4");
        assert_eq!(content_type_for("b.WebM"), "video/webm");
        assert_eq!(content_type_for("c.txt"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
