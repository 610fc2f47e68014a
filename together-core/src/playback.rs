use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ClipId;

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

/// Where a room is in its playback lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No clip selected yet
    #[default]
    Idle,
    /// A clip was selected and members are retrieving it
    Preparing,
    /// Every member has the clip, playback has not started
    Synced,
    Playing,
    Paused,
}

impl Phase {
    /// Whether playback commands are accepted in this phase.
    pub fn accepts_playback(&self) -> bool {
        matches!(self, Self::Synced | Self::Playing | Self::Paused)
    }
}

/// The authoritative playback state of a room.
///
/// Position is stored as an anchor: the position at the last update, and the
/// monotonic instant of that update. The current position is reconstructed from
/// the elapsed time, so nothing has to tick while a clip plays.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    clip: Option<ClipId>,
    playing: bool,
    /// Position in seconds at `anchor`
    position: f64,
    speed: f64,
    anchor: Instant,
}

impl PlaybackState {
    pub fn new(now: Instant) -> Self {
        Self {
            clip: None,
            playing: false,
            position: 0.0,
            speed: 1.0,
            anchor: now,
        }
    }

    /// The position in seconds at the given instant.
    pub fn position_at(&self, now: Instant) -> f64 {
        if !self.playing {
            return self.position;
        }

        let elapsed = now.saturating_duration_since(self.anchor).as_secs_f64();
        self.position + elapsed * self.speed
    }

    /// Moves the anchor to `now`, folding the elapsed time into the position.
    fn rebase(&mut self, now: Instant) {
        self.position = self.position_at(now);
        self.anchor = now;
    }

    /// Loads a clip paused at its start. Speed carries over.
    pub fn load(&mut self, clip: ClipId, now: Instant) {
        self.clip = Some(clip);
        self.playing = false;
        self.position = 0.0;
        self.anchor = now;
    }

    /// Forgets the current clip, e.g. when its file is gone.
    pub fn unload(&mut self, now: Instant) {
        self.clip = None;
        self.playing = false;
        self.position = 0.0;
        self.anchor = now;
    }

    pub fn play(&mut self, now: Instant) {
        self.rebase(now);
        self.playing = true;
    }

    pub fn pause(&mut self, now: Instant) {
        self.rebase(now);
        self.playing = false;
    }

    pub fn seek(&mut self, position: f64, now: Instant) {
        self.rebase(now);
        self.position = position.max(0.0);
    }

    /// Changes the speed. The caller validates the range.
    pub fn set_speed(&mut self, speed: f64, now: Instant) {
        self.rebase(now);
        self.speed = speed;
    }

    pub fn clip(&self) -> Option<ClipId> {
        self.clip
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

/// Whether a speed multiplier is one a player can reasonably honor.
pub fn is_valid_speed(speed: f64) -> bool {
    speed.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&speed)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{is_valid_speed, PlaybackState};
    use crate::ClipId;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn position_advances_only_while_playing() {
        let start = Instant::now();
        let mut state = PlaybackState::new(start);
        state.load(ClipId::new(), start);

        assert!(approx(state.position_at(start + Duration::from_secs(5)), 0.0));

        state.play(start);
        assert!(approx(state.position_at(start + Duration::from_secs(10)), 10.0));

        state.pause(start + Duration::from_secs(10));
        assert!(approx(state.position_at(start + Duration::from_secs(60)), 10.0));
    }

    #[test]
    fn speed_changes_rebase_the_anchor() {
        let start = Instant::now();
        let mut state = PlaybackState::new(start);
        state.load(ClipId::new(), start);
        state.play(start);

        // 4 seconds at 1x, then 4 seconds at 2x
        state.set_speed(2.0, start + Duration::from_secs(4));
        assert!(approx(state.position_at(start + Duration::from_secs(8)), 12.0));
    }

    #[test]
    fn seek_keeps_play_state_and_clamps() {
        let start = Instant::now();
        let mut state = PlaybackState::new(start);
        state.load(ClipId::new(), start);
        state.play(start);

        state.seek(-3.0, start + Duration::from_secs(2));
        assert!(state.is_playing());
        assert!(approx(state.position_at(start + Duration::from_secs(3)), 1.0));
    }

    #[test]
    fn speed_bounds() {
        assert!(is_valid_speed(1.0));
        assert!(is_valid_speed(0.25));
        assert!(!is_valid_speed(0.0));
        assert!(!is_valid_speed(f64::NAN));
        assert!(!is_valid_speed(8.0));
    }
}
