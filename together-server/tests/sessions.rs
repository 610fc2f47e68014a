use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde_json::json;
use tempfile::TempDir;
use tokio::{net::TcpListener, net::TcpStream, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use together_collab::Collab;
use together_core::{
    ClientMessage, Config, ErrorBody, ErrorKind, Health, PasswordCost, RoomAccess, ServerMessage,
    UploadReceipt, CLIP_NAME_HEADER, CLIP_SHA256_HEADER, CLIP_SIZE_HEADER,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    http: Client,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let collab = Arc::new(Collab::new(Config {
            upload_dir: dir.path().to_path_buf(),
            max_file_size: 1024 * 1024,
            password_cost: PasswordCost {
                memory_kib: 8,
                iterations: 1,
            },
            ..Default::default()
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(together_server::serve(listener, collab));

        Self {
            addr,
            http: Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn create_room(&self, password: &str, handle: &str) -> RoomAccess {
        let response = self
            .http
            .post(self.url("/rooms"))
            .json(&json!({ "password": password, "displayHandle": handle }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn join(&self, code: &str, password: &str, handle: &str) -> reqwest::Response {
        self.http
            .post(self.url(&format!("/rooms/{}/join", code)))
            .json(&json!({ "password": password, "displayHandle": handle }))
            .send()
            .await
            .unwrap()
    }

    async fn connect(&self, code: &str, token: &str) -> Socket {
        let url = format!("ws://{}/sessions/{}", self.addr, code);
        let (mut socket, _) = connect_async(url).await.unwrap();

        send(
            &mut socket,
            ClientMessage::Auth {
                token: token.to_string(),
            },
        )
        .await;

        socket
    }
}

async fn send(socket: &mut Socket, message: ClientMessage) {
    let text = message.encode().unwrap();
    socket.send(Message::text(text)).await.unwrap();
}

/// Reads messages until one matches, skipping presence and activity chatter.
async fn expect<T>(socket: &mut Socket, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
    let wait = async {
        loop {
            let frame = socket.next().await.unwrap().unwrap();

            if !frame.is_text() {
                continue;
            }

            let message = ServerMessage::decode(frame.to_text().unwrap()).unwrap();

            if let Some(found) = pick(message) {
                return found;
            }
        }
    };

    timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected message did not arrive")
}

#[tokio::test]
async fn a_room_syncs_and_plays_a_clip() {
    let server = TestServer::start().await;

    let host = server.create_room("hunter2", "host").await;
    let code = host.code.to_string();
    assert!(host.snapshot.is_host());

    let response = server.join(&code.to_lowercase(), "hunter2", "guest").await;
    assert_eq!(response.status(), StatusCode::OK);
    let guest: RoomAccess = response.json().await.unwrap();
    assert_ne!(guest.member_id, host.member_id);
    assert_eq!(guest.snapshot.members.len(), 2);

    let mut host_socket = server.connect(&code, &host.token).await;
    let mut guest_socket = server.connect(&code, &guest.token).await;

    let snapshot = expect(&mut guest_socket, |m| match m {
        ServerMessage::Snapshot(s) => Some(s),
        _ => None,
    })
    .await;
    assert_eq!(snapshot.you, guest.member_id);
    assert_eq!(snapshot.host, host.member_id);

    // Upload a clip as the guest
    let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let response = server
        .http
        .post(server.url(&format!("/rooms/{}/upload", code)))
        .bearer_auth(&guest.token)
        .header(CLIP_NAME_HEADER, "intro.mp4")
        .body(bytes.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let receipt: UploadReceipt = response.json().await.unwrap();
    assert_eq!(receipt.clip.size, bytes.len() as u64);
    assert_eq!(receipt.clip.content_type, "video/mp4");

    let announced = expect(&mut host_socket, |m| match m {
        ServerMessage::VideoUploaded { clip } => Some(clip),
        _ => None,
    })
    .await;
    assert_eq!(announced.id, receipt.asset_id);

    // The host selects it and everyone prepares
    send(
        &mut host_socket,
        ClientMessage::SelectClip {
            clip: receipt.asset_id,
        },
    )
    .await;

    let round = expect(&mut guest_socket, |m| match m {
        ServerMessage::Prepare { round, clip, .. } if clip.id == receipt.asset_id => Some(round),
        _ => None,
    })
    .await;

    let video_url = server.url(&format!("/rooms/{}/videos/{}", code, receipt.asset_id));

    let partial = server
        .http
        .get(&video_url)
        .query(&[("token", guest.token.as_str())])
        .header(header::RANGE, "bytes=100-199")
        .send()
        .await
        .unwrap();

    assert_eq!(partial.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        partial.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 100-199/4096"
    );
    assert_eq!(partial.bytes().await.unwrap().as_ref(), &bytes[100..200]);

    let full = server
        .http
        .get(&video_url)
        .bearer_auth(&guest.token)
        .send()
        .await
        .unwrap();

    assert_eq!(full.status(), StatusCode::OK);
    assert_eq!(
        full.headers()[CLIP_SHA256_HEADER].to_str().unwrap(),
        receipt.clip.sha256
    );
    assert_eq!(full.bytes().await.unwrap().as_ref(), bytes.as_slice());

    send(&mut guest_socket, ClientMessage::Ready { round }).await;
    send(&mut host_socket, ClientMessage::Ready { round }).await;

    let synced = expect(&mut host_socket, |m| match m {
        ServerMessage::AllReady { round, .. } => Some(round),
        _ => None,
    })
    .await;
    assert_eq!(synced, round);

    send(&mut host_socket, ClientMessage::Play).await;

    let issuer = expect(&mut guest_socket, |m| match m {
        ServerMessage::Play { issued_by, .. } => Some(issued_by),
        _ => None,
    })
    .await;
    assert_eq!(issuer, "host");

    // Guests cannot drive playback
    send(&mut guest_socket, ClientMessage::Pause).await;

    let kind = expect(&mut guest_socket, |m| match m {
        ServerMessage::Error { kind, .. } => Some(kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Forbidden);

    let health: Health = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health.rooms, 1);
}

#[tokio::test]
async fn joins_are_checked_and_rate_limited() {
    let server = TestServer::start().await;
    let host = server.create_room("secret", "host").await;
    let code = host.code.to_string();

    // Five attempts are allowed per window, counting failures
    for _ in 0..5 {
        let response = server.join(&code, "wrong", "guest").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.kind, ErrorKind::Forbidden);
    }

    let limited = server.join(&code, "secret", "guest").await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn oversized_uploads_and_bad_sessions_are_refused() {
    let server = TestServer::start().await;
    let host = server.create_room("secret", "host").await;
    let code = host.code.to_string();

    let response = server
        .http
        .post(server.url(&format!("/rooms/{}/upload", code)))
        .bearer_auth(&host.token)
        .header(CLIP_SIZE_HEADER, "2000000")
        .body(vec![0u8; 16])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let missing = server
        .http
        .get(server.url(&format!("/rooms/{}/videos/999999", code)))
        .bearer_auth(&host.token)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let unknown = server.join("AAAAA-00000-AAAAA", "secret", "guest").await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let mut socket = server.connect(&code, "not-a-token").await;

    let kind = expect(&mut socket, |m| match m {
        ServerMessage::Error { kind, .. } => Some(kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Forbidden);
}
