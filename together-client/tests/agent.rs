use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::mpsc::UnboundedReceiver,
    time::{sleep, timeout},
};
use together_client::{
    AgentEvent, AgentHandle, AgentOptions, ClipCache, ConnectionState, Player, RoomApi,
    SessionAgent, WsDialer,
};
use together_collab::Collab;
use together_core::{Config, PasswordCost, RoomAccess, ServerMessage};

#[derive(Default)]
struct Calls {
    loaded: bool,
    playing: bool,
}

struct SharedPlayer(Arc<Mutex<Calls>>);

impl Player for SharedPlayer {
    fn load(&mut self, path: &Path) {
        assert!(path.is_file());
        self.0.lock().unwrap().loaded = true;
    }

    fn play(&mut self) {
        self.0.lock().unwrap().playing = true;
    }

    fn pause(&mut self) {
        self.0.lock().unwrap().playing = false;
    }

    fn seek(&mut self, _position: f64) {}

    fn set_speed(&mut self, _speed: f64) {}

    fn position(&self) -> f64 {
        0.0
    }
}

async fn start_server(dir: &Path) -> String {
    let collab = Arc::new(Collab::new(Config {
        upload_dir: dir.to_path_buf(),
        password_cost: PasswordCost {
            memory_kib: 8,
            iterations: 1,
        },
        ..Default::default()
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(together_server::serve(listener, collab));

    format!("http://{}", addr)
}

fn spawn_agent(
    api: &RoomApi,
    access: &RoomAccess,
) -> (AgentHandle, UnboundedReceiver<AgentEvent>, Arc<Mutex<Calls>>) {
    let calls = Arc::new(Mutex::new(Calls::default()));
    let dialer = WsDialer::new(api.base(), &access.code, access.token.clone());

    let (agent, handle, events) = SessionAgent::new(
        Box::new(dialer),
        Arc::new(api.clone()),
        Box::new(SharedPlayer(calls.clone())),
        ClipCache::new().unwrap(),
        AgentOptions::default(),
    );

    tokio::spawn(agent.run());
    (handle, events, calls)
}

async fn wait_for_snapshot(events: &mut UnboundedReceiver<AgentEvent>) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let AgentEvent::Server(ServerMessage::Snapshot(_)) = event {
                return;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn agents_retrieve_verify_and_play_a_selected_clip() {
    let dir = tempfile::tempdir().unwrap();
    let base = start_server(dir.path()).await;

    let mut host_api = RoomApi::new(&base);
    let host = host_api.create_room("pass", "host").await.unwrap();

    let mut guest_api = RoomApi::new(&base);
    let guest = guest_api
        .join_room(&host.code, "pass", "guest")
        .await
        .unwrap();

    let (host_handle, mut host_events, host_calls) = spawn_agent(&host_api, &host);
    let (guest_handle, mut guest_events, guest_calls) = spawn_agent(&guest_api, &guest);

    wait_for_snapshot(&mut host_events).await;
    wait_for_snapshot(&mut guest_events).await;

    let clip_path = dir.path().join("sample.webm");
    let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    tokio::fs::write(&clip_path, &bytes).await.unwrap();

    let receipt = guest_api.upload(&clip_path).await.unwrap();
    assert_eq!(receipt.clip.size, bytes.len() as u64);
    assert_eq!(receipt.clip.content_type, "video/webm");

    host_handle.select_clip(receipt.asset_id).unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            let done = [&host_calls, &guest_calls].iter().all(|calls| {
                let calls = calls.lock().unwrap();
                calls.loaded && calls.playing
            });

            if done {
                break;
            }

            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    guest_handle.leave();

    let state = timeout(Duration::from_secs(5), async {
        loop {
            match guest_events.recv().await {
                Some(AgentEvent::State(state)) if state == ConnectionState::Disconnected => {
                    return state;
                }
                Some(_) => continue,
                None => return ConnectionState::Disconnected,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(state, ConnectionState::Disconnected);
}
