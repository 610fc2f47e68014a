use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use together_core::{ClientMessage, RoomCode, ServerMessage};

use crate::ClientError;

/// An open session channel, as a pair of message queues.
///
/// `incoming` ends when the channel drops.
pub struct SessionLink {
    pub outgoing: UnboundedSender<ClientMessage>,
    pub incoming: UnboundedReceiver<ServerMessage>,
}

impl SessionLink {
    /// Builds a link and the remote ends of its queues.
    pub fn pair() -> (
        Self,
        UnboundedReceiver<ClientMessage>,
        UnboundedSender<ServerMessage>,
    ) {
        let (outgoing, remote_incoming) = mpsc::unbounded_channel();
        let (remote_outgoing, incoming) = mpsc::unbounded_channel();

        let link = Self { outgoing, incoming };
        (link, remote_incoming, remote_outgoing)
    }
}

/// Opens authenticated session channels to a room.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<SessionLink, ClientError>;
}

/// Dials `/sessions/{code}` over a websocket and authenticates with a member
/// token.
pub struct WsDialer {
    url: String,
    token: String,
}

impl WsDialer {
    /// `base` is the server's http(s) url, e.g. `http://localhost:8765`.
    pub fn new(base: &str, code: &RoomCode, token: String) -> Self {
        let base = base.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        Self {
            url: format!("{}/sessions/{}", ws_base, code),
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<SessionLink, ClientError> {
        let (socket, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let auth = ClientMessage::Auth {
            token: self.token.clone(),
        };
        sink.send(Message::text(auth.encode()?)).await?;

        let (link, mut to_server, from_server) = SessionLink::pair();

        tokio::spawn(async move {
            while let Some(message) = to_server.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Could not encode a session message: {}", e);
                        continue;
                    }
                };

                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }

            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                if frame.is_close() {
                    break;
                }

                let Ok(text) = frame.to_text() else {
                    continue;
                };

                if text.is_empty() {
                    continue;
                }

                match ServerMessage::decode(text) {
                    Ok(message) => {
                        if from_server.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring a server frame: {}", e),
                }
            }
        });

        Ok(link)
    }
}

#[cfg(test)]
mod test {
    use together_core::RoomCode;

    use super::WsDialer;

    #[test]
    fn http_urls_become_websocket_urls() {
        let code = RoomCode::parse("ABCDE-12345-FGHIJ").unwrap();

        let plain = WsDialer::new("http://localhost:8765/", &code, "t".into());
        assert_eq!(plain.url(), "ws://localhost:8765/sessions/ABCDE-12345-FGHIJ");

        let secure = WsDialer::new("https://watch.example", &code, "t".into());
        assert_eq!(secure.url(), "wss://watch.example/sessions/ABCDE-12345-FGHIJ");
    }
}
