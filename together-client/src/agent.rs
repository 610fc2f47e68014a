use std::{path::PathBuf, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use together_core::{ClientMessage, ClipId, ClipInfo, Phase, RoomSnapshot, ServerMessage};

use crate::{
    compensate, ClientError, ClipCache, ClipSource, Dialer, Player, ReconnectPolicy, SessionLink,
};

/// Ping intervals without a pong before the ping counts as lost.
const PING_LOST_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts are used up
    GivenUp,
}

/// What the agent tells the application about.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    State(ConnectionState),
    /// Every message from the server, after the agent applied it
    Server(ServerMessage),
    Latency(Duration),
    /// A clip is verified and loaded into the player
    Loaded { clip: ClipId },
    FetchFailed { clip: ClipId, error: String },
    /// The session ended for good, e.g. after a kick
    Ended { reason: String },
}

enum Command {
    Request(ClientMessage),
    Leave,
}

/// Sends local actions to a running [SessionAgent]. They are requests: nothing
/// changes locally until the server broadcasts the result.
#[derive(Clone)]
pub struct AgentHandle {
    commands: UnboundedSender<Command>,
}

impl AgentHandle {
    pub fn request(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.commands
            .send(Command::Request(message))
            .map_err(|_| ClientError::Closed)
    }

    pub fn play(&self) -> Result<(), ClientError> {
        self.request(ClientMessage::Play)
    }

    pub fn pause(&self) -> Result<(), ClientError> {
        self.request(ClientMessage::Pause)
    }

    pub fn seek(&self, position: f64) -> Result<(), ClientError> {
        self.request(ClientMessage::Seek { position })
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), ClientError> {
        self.request(ClientMessage::Speed { speed })
    }

    pub fn select_clip(&self, clip: ClipId) -> Result<(), ClientError> {
        self.request(ClientMessage::SelectClip { clip })
    }

    /// Leaves the room and stops the agent.
    pub fn leave(&self) {
        let _ = self.commands.send(Command::Leave);
    }
}

pub struct AgentOptions {
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
    /// Whether the host starts playback once everyone is ready
    pub auto_play: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(5),
            auto_play: true,
        }
    }
}

enum Fetch {
    Progress {
        round: Option<u64>,
        received: u64,
        total: u64,
    },
    Done {
        round: Option<u64>,
        clip: ClipId,
        result: Result<PathBuf, String>,
    },
}

enum Outcome {
    Dropped,
    Left,
    Ended(String),
}

/// Where the room's playback was at some instant.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    position: f64,
    playing: bool,
    speed: f64,
    at: Instant,
}

impl Anchor {
    fn position_now(&self) -> f64 {
        if self.playing {
            self.position + self.at.elapsed().as_secs_f64() * self.speed
        } else {
            self.position
        }
    }
}

/// Keeps one member's session to a room: reconnects with backoff, retrieves
/// selected clips, reports readiness, and applies playback commands to the
/// local [Player].
pub struct SessionAgent {
    dialer: Box<dyn Dialer>,
    source: Arc<dyn ClipSource>,
    player: Box<dyn Player>,
    cache: ClipCache,
    options: AgentOptions,

    commands: UnboundedReceiver<Command>,
    events: UnboundedSender<AgentEvent>,
    fetch_tx: UnboundedSender<Fetch>,
    fetch_rx: UnboundedReceiver<Fetch>,
    fetching: Option<(ClipId, JoinHandle<()>)>,

    state: ConnectionState,
    authenticated: bool,
    snapshot: Option<RoomSnapshot>,
    /// The round to report ready for once the clip is here
    round: Option<u64>,
    loaded: Option<ClipId>,
    anchor: Option<Anchor>,
    rtt: Option<Duration>,
    ping: Option<(u64, Instant)>,
    next_nonce: u64,
}

impl SessionAgent {
    pub fn new(
        dialer: Box<dyn Dialer>,
        source: Arc<dyn ClipSource>,
        player: Box<dyn Player>,
        cache: ClipCache,
        options: AgentOptions,
    ) -> (Self, AgentHandle, UnboundedReceiver<AgentEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let agent = Self {
            dialer,
            source,
            player,
            cache,
            options,
            commands,
            events,
            fetch_tx,
            fetch_rx,
            fetching: None,
            state: ConnectionState::Disconnected,
            authenticated: false,
            snapshot: None,
            round: None,
            loaded: None,
            anchor: None,
            rtt: None,
            ping: None,
            next_nonce: 1,
        };

        (agent, AgentHandle { commands: command_tx }, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs the session until the member leaves, is removed, or reconnecting
    /// gives up. Returns the final state.
    pub async fn run(mut self) -> ConnectionState {
        let mut attempt = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            match self.dialer.dial().await {
                Ok(link) => {
                    self.set_state(ConnectionState::Connected);

                    let outcome = self.drive(link).await;

                    if self.authenticated {
                        attempt = 0;
                    }

                    match outcome {
                        Outcome::Dropped => warn!("Lost the session channel"),
                        Outcome::Left => return self.finish(ConnectionState::Disconnected),
                        Outcome::Ended(reason) => {
                            info!("Session ended: {}", reason);
                            self.emit(AgentEvent::Ended { reason });
                            return self.finish(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Cannot reconnect: {}", e);
                    self.emit(AgentEvent::Ended {
                        reason: e.to_string(),
                    });
                    return self.finish(ConnectionState::GivenUp);
                }
                Err(e) => warn!("Could not open the session channel: {}", e),
            }

            attempt += 1;

            let Some(delay) = self.options.policy.delay(attempt) else {
                warn!("Giving up after {} reconnect attempts", attempt - 1);
                return self.finish(ConnectionState::GivenUp);
            };

            self.set_state(ConnectionState::Reconnecting);
            info!(
                "Reconnecting in {}s (attempt {}/{})",
                delay.as_secs(),
                attempt,
                self.options.policy.max_attempts
            );

            if !self.wait(delay).await {
                return self.finish(ConnectionState::Disconnected);
            }
        }
    }

    /// Sleeps between attempts. Returns false if the member left meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Request(message)) => {
                        debug!("Dropping {:?} while disconnected", message);
                    }
                    Some(Command::Leave) | None => return false,
                },
            }
        }
    }

    fn finish(mut self, state: ConnectionState) -> ConnectionState {
        if let Some((_, task)) = self.fetching.take() {
            task.abort();
        }

        if let Err(e) = self.cache.clear() {
            warn!("Could not clear the clip cache: {}", e);
        }

        self.set_state(state);
        state
    }

    async fn drive(&mut self, link: SessionLink) -> Outcome {
        let SessionLink {
            outgoing,
            mut incoming,
        } = link;

        self.authenticated = false;
        self.ping = None;

        let mut pinger = interval(self.options.ping_interval);
        pinger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = incoming.recv() => match message {
                    Some(message) => {
                        if let Some(outcome) = self.dispatch(message, &outgoing) {
                            return outcome;
                        }
                    }
                    None => return Outcome::Dropped,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Request(message)) => {
                        let _ = outgoing.send(message);
                    }
                    Some(Command::Leave) | None => {
                        let _ = outgoing.send(ClientMessage::Leave);
                        return Outcome::Left;
                    }
                },
                Some(fetch) = self.fetch_rx.recv() => self.on_fetch(fetch, &outgoing),
                _ = pinger.tick() => {
                    // A pong that never came must not stop the pings
                    let lost = PING_LOST_AFTER * self.options.ping_interval;
                    if self.ping.is_some_and(|(_, at)| at.elapsed() >= lost) {
                        debug!("Dropping an unanswered ping");
                        self.ping = None;
                    }

                    if self.authenticated && self.ping.is_none() {
                        let nonce = self.next_nonce;
                        self.next_nonce += 1;
                        self.ping = Some((nonce, Instant::now()));
                        let _ = outgoing.send(ClientMessage::Ping { nonce });
                    }
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        message: ServerMessage,
        outgoing: &UnboundedSender<ClientMessage>,
    ) -> Option<Outcome> {
        match &message {
            ServerMessage::Snapshot(snapshot) => {
                self.authenticated = true;
                self.apply_snapshot(snapshot.clone());
            }
            ServerMessage::Prepare { round, clip, .. } => {
                self.anchor = None;
                self.prepare(Some(*round), clip.clone());
            }
            ServerMessage::AllReady { clip, .. } => {
                self.round = None;
                self.load(*clip);

                let is_host = self.snapshot.as_ref().is_some_and(|s| s.is_host());

                if self.options.auto_play && is_host {
                    let _ = outgoing.send(ClientMessage::Play);
                }
            }
            ServerMessage::Play {
                position, speed, ..
            } => self.apply_playback(*position, true, Some(*speed)),
            ServerMessage::Pause { position, .. } => self.apply_playback(*position, false, None),
            ServerMessage::Seek {
                position, playing, ..
            } => self.apply_playback(*position, *playing, None),
            ServerMessage::Speed {
                speed,
                position,
                playing,
                ..
            } => self.apply_playback(*position, *playing, Some(*speed)),
            ServerMessage::HostChanged { host, .. } => {
                if let Some(snapshot) = &mut self.snapshot {
                    snapshot.host = *host;
                }
            }
            ServerMessage::VideoUploaded { clip } => {
                if let Some(snapshot) = &mut self.snapshot {
                    snapshot.clips.push(clip.clone());
                }
            }
            ServerMessage::Ping { nonce } => {
                let _ = outgoing.send(ClientMessage::Pong { nonce: *nonce });
            }
            ServerMessage::Pong { nonce } => {
                if let Some((sent, at)) = self.ping {
                    if sent == *nonce {
                        let rtt = at.elapsed();
                        self.rtt = Some(rtt);
                        self.ping = None;
                        self.emit(AgentEvent::Latency(rtt));
                    }
                }
            }
            ServerMessage::Kick { kicked_by } => {
                self.emit(AgentEvent::Server(message.clone()));
                return Some(Outcome::Ended(format!("Removed by {}", kicked_by)));
            }
            ServerMessage::RoomClosed { reason } => {
                self.emit(AgentEvent::Server(message.clone()));
                return Some(Outcome::Ended(reason.clone()));
            }
            ServerMessage::Error { message: text, .. } if !self.authenticated => {
                self.emit(AgentEvent::Server(message.clone()));
                return Some(Outcome::Ended(text.clone()));
            }
            _ => {}
        }

        self.emit(AgentEvent::Server(message));
        None
    }

    /// Catches up with a room after (re)connecting.
    fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        let clip = snapshot.clip.and_then(|id| snapshot.clip_info(id).cloned());

        self.anchor = Some(Anchor {
            position: snapshot.position,
            playing: snapshot.playing,
            speed: snapshot.speed,
            at: Instant::now(),
        });

        let round = match snapshot.phase {
            Phase::Preparing => snapshot.round,
            _ => None,
        };

        self.snapshot = Some(snapshot);

        match clip {
            // Re-selected while we were away, the staged copy can report ready
            Some(clip) if self.loaded == Some(clip.id) && round.is_some() => {
                self.prepare(round, clip)
            }
            Some(clip) if self.loaded == Some(clip.id) => {
                self.round = None;
                self.sync_player();
            }
            Some(clip) => self.prepare(round, clip),
            None => self.round = None,
        }
    }

    /// Starts retrieving a clip, unless it is already staged.
    fn prepare(&mut self, round: Option<u64>, clip: ClipInfo) {
        self.round = round;

        if let Err(e) = self.cache.supersede(clip.id) {
            warn!("Could not clean the clip cache: {}", e);
        }

        if self.cache.get(clip.id).is_some() {
            let _ = self.fetch_tx.send(Fetch::Done {
                round,
                clip: clip.id,
                result: Ok(self.cache.clip_path(clip.id)),
            });
            return;
        }

        match &self.fetching {
            Some((current, task)) if *current == clip.id && !task.is_finished() => return,
            Some((_, task)) => task.abort(),
            None => {}
        }

        let source = self.source.clone();
        let staging = self.cache.partial_path(clip.id);
        let dest = self.cache.clip_path(clip.id);
        let updates = self.fetch_tx.clone();
        let clip_id = clip.id;

        let task = tokio::spawn(async move {
            let progress_updates = updates.clone();
            let progress = move |received: u64, total: u64| {
                let _ = progress_updates.send(Fetch::Progress {
                    round,
                    received,
                    total,
                });
            };

            let result = source
                .fetch(&clip, &staging, &dest, &progress)
                .await
                .map(|_| dest)
                .map_err(|e| e.to_string());

            let _ = updates.send(Fetch::Done {
                round,
                clip: clip_id,
                result,
            });
        });

        self.fetching = Some((clip_id, task));
    }

    fn on_fetch(&mut self, fetch: Fetch, outgoing: &UnboundedSender<ClientMessage>) {
        match fetch {
            Fetch::Progress {
                round: Some(round),
                received,
                total,
            } if self.round == Some(round) => {
                let _ = outgoing.send(ClientMessage::DownloadProgress {
                    round,
                    received,
                    total,
                });
            }
            Fetch::Progress { .. } => {}
            Fetch::Done {
                round,
                clip,
                result: Ok(_),
            } => {
                self.fetching = None;

                match round {
                    Some(round) if self.round == Some(round) => {
                        info!("Clip {} is ready", clip);
                        let _ = outgoing.send(ClientMessage::Ready { round });
                    }
                    Some(_) => {}
                    // Joined mid-clip, catch up right away
                    None => {
                        self.load(clip);
                        self.sync_player();
                    }
                }
            }
            Fetch::Done {
                clip,
                result: Err(error),
                ..
            } => {
                self.fetching = None;
                warn!("Could not retrieve clip {}: {}", clip, error);
                self.emit(AgentEvent::FetchFailed { clip, error });
            }
        }
    }

    fn load(&mut self, clip: ClipId) {
        if self.loaded == Some(clip) {
            return;
        }

        let Some(path) = self.cache.get(clip) else {
            debug!("Clip {} is not staged yet", clip);
            return;
        };

        self.player.load(&path);
        self.loaded = Some(clip);
        self.emit(AgentEvent::Loaded { clip });
    }

    fn apply_playback(&mut self, position: f64, playing: bool, speed: Option<f64>) {
        let speed = speed
            .or(self.anchor.map(|a| a.speed))
            .unwrap_or(1.0);

        self.anchor = Some(Anchor {
            position: compensate(position, speed, playing, self.rtt),
            playing,
            speed,
            at: Instant::now(),
        });

        self.sync_player();
    }

    /// Moves the loaded clip to where the room is.
    fn sync_player(&mut self) {
        let Some(anchor) = self.anchor else {
            return;
        };

        if self.loaded.is_none() {
            return;
        }

        self.player.set_speed(anchor.speed);
        self.player.seek(anchor.position_now());

        if anchor.playing {
            self.player.play();
        } else {
            self.player.pause();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(AgentEvent::State(state));
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}
