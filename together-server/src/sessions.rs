use std::{borrow::Cow, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    time::timeout,
};
use together_collab::{Outbound, Room};
use together_core::{ClientMessage, ErrorKind, MemberId, ServerMessage};

use crate::{context::ServerContext, errors::ServerResult, rooms::parse_code, Router};

async fn open_session(
    State(context): State<ServerContext>,
    Path(code): Path<String>,
    upgrade: WebSocketUpgrade,
) -> ServerResult<Response> {
    let code = parse_code(&code)?;
    let room = context.collab.rooms.room(&code)?;
    let auth_timeout = context.collab.config().auth_timeout;

    Ok(upgrade.on_upgrade(move |socket| async move {
        let Some((socket, member)) = authenticate(socket, &room, auth_timeout).await else {
            return;
        };

        run_session(socket, room, member).await;
    }))
}

/// Waits for the `auth` message. On failure the client is told why and the
/// socket is closed.
async fn authenticate(
    mut socket: WebSocket,
    room: &Room,
    limit: std::time::Duration,
) -> Option<(WebSocket, MemberId)> {
    let first = match timeout(limit, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => ClientMessage::decode(&text).ok(),
        Ok(_) => None,
        Err(_) => {
            debug!("Session for {} did not authenticate in time", room.code());
            None
        }
    };

    let result = match first {
        Some(ClientMessage::Auth { token }) => room.member_by_token(&token).map_err(|e| {
            warn!("Rejected session for {}: {}", room.code(), e);
            ServerMessage::error(e.kind(), e.to_string())
        }),
        _ => Err(ServerMessage::error(
            ErrorKind::Forbidden,
            "The first message must be auth",
        )),
    };

    match result {
        Ok(member) => Some((socket, member)),
        Err(message) => {
            if let Ok(text) = message.encode() {
                let _ = socket.send(Message::Text(text)).await;
            }

            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::from("Authentication failed"),
                })))
                .await;

            None
        }
    }
}

async fn run_session(socket: WebSocket, room: Arc<Room>, member: MemberId) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = match room.attach(member, tx) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Could not attach session to {}: {}", room.code(), e);
            return;
        }
    };

    let mut writer = tokio::spawn(write_outbound(sender, rx));

    let reader = async {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Binary(_) => {
                    room.send(
                        member,
                        ServerMessage::error(ErrorKind::Malformed, "Expected a text frame"),
                    );
                    continue;
                }
                _ => continue,
            };

            let message = match ClientMessage::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    room.send(member, ServerMessage::error(e.kind(), e.to_string()));
                    continue;
                }
            };

            let leaving = matches!(message, ClientMessage::Leave);

            if room.submit(member, message).is_err() || leaving {
                break;
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {},
        _ = reader => {},
    }

    drop(handle);
    writer.abort();

    debug!("Session for member {} of {} ended", member, room.code());
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let message = match item {
            Outbound::Message(message) => match message.encode() {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    warn!("Could not encode a server message: {}", e);
                    continue;
                }
            },
            Outbound::Close { reason } => {
                info!("Closing session: {}", reason);

                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: Cow::from(reason),
                    })))
                    .await;

                break;
            }
        };

        if sender.send(message).await.is_err() {
            break;
        }
    }
}

pub fn router() -> Router {
    Router::new().route("/:code", get(open_session))
}
