use std::{sync::Arc, time::Duration};

use log::{debug, info};
use tokio::{
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};

use crate::{CollabContext, JoinLimiter, RoomManager};

/// The room store's timers, aborted on drop.
pub struct BackgroundTasks {
    sweeper: JoinHandle<()>,
    prober: JoinHandle<()>,
}

impl BackgroundTasks {
    pub(crate) fn spawn(context: &CollabContext) -> Self {
        let config = &context.config;

        let sweeper = tokio::spawn(run_sweeper(
            RoomManager::new(context),
            context.limiter.clone(),
            config.sweep_interval,
        ));

        let prober = tokio::spawn(run_prober(RoomManager::new(context), config.probe_interval));

        info!(
            "Sweeping rooms every {}s, probing connections every {}s",
            config.sweep_interval.as_secs(),
            config.probe_interval.as_secs()
        );

        Self { sweeper, prober }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.prober.abort();
    }
}

async fn run_sweeper(rooms: RoomManager, limiter: Arc<JoinLimiter>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let now = Instant::now();
        let report = rooms.sweep_expired(now);
        limiter.prune_all(now);

        if report.removed.is_empty() {
            debug!("Sweep found no expired rooms");
        } else {
            info!("Swept {} expired room(s)", report.removed.len());
        }
    }
}

async fn run_prober(rooms: RoomManager, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        rooms.check_liveness(Instant::now());
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::sleep};
    use together_core::{ClientMessage, Config, RoomCode, ServerMessage};

    use crate::{Collab, Outbound, Room};

    #[tokio::test(start_paused = true)]
    async fn absent_hosts_are_replaced_and_idle_rooms_expire() {
        let dir = tempfile::tempdir().unwrap();
        let collab = Collab::new(Config {
            upload_dir: dir.path().to_path_buf(),
            room_inactivity: Duration::from_secs(120),
            ..Default::default()
        });
        let _tasks = collab.start_background();

        let code = RoomCode::generate();
        let room = Room::new(code.clone(), String::new(), collab.context.config.clone());
        collab.context.rooms.insert(code.clone(), room.clone());

        // The host never connects, the guest does
        let host = room.add_member("host".into()).unwrap().id;
        let guest = room.add_member("guest".into()).unwrap().id;
        let (tx, _rx) = mpsc::unbounded_channel();
        let _session = room.attach(guest, tx).unwrap();

        assert_eq!(room.host(), Some(host));

        sleep(Duration::from_secs(40)).await;
        assert!(!room.is_member(host));
        assert_eq!(room.host(), Some(guest));

        sleep(Duration::from_secs(160)).await;
        assert!(collab.rooms.room(&code).is_err());
        assert!(room.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn pinging_members_keep_their_room() {
        let dir = tempfile::tempdir().unwrap();
        let collab = Collab::new(Config {
            upload_dir: dir.path().to_path_buf(),
            room_inactivity: Duration::from_secs(120),
            ..Default::default()
        });
        let _tasks = collab.start_background();

        let code = RoomCode::generate();
        let room = Room::new(code.clone(), String::new(), collab.context.config.clone());
        collab.context.rooms.insert(code.clone(), room.clone());

        let member = room.add_member("viewer".into()).unwrap().id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = room.attach(member, tx).unwrap();

        // A long uninterrupted watch only exchanges pings and pongs
        for nonce in 0..40 {
            sleep(Duration::from_secs(5)).await;
            room.handle_message(member, ClientMessage::Ping { nonce });

            while let Ok(outbound) = rx.try_recv() {
                if let Outbound::Message(ServerMessage::Ping { nonce }) = outbound {
                    room.handle_message(member, ClientMessage::Pong { nonce });
                }
            }
        }

        assert!(collab.rooms.room(&code).is_ok());
        assert!(room.is_member(member));
        assert!(!room.is_closed());
    }
}
