use std::{path::Path, time::Duration};

/// The local video player the agent drives. Implementations wrap whatever
/// actually renders video.
pub trait Player: Send {
    fn load(&mut self, path: &Path);
    fn play(&mut self);
    fn pause(&mut self);
    /// Seconds from the start of the clip
    fn seek(&mut self, position: f64);
    fn set_speed(&mut self, speed: f64);
    fn position(&self) -> f64;
}

/// Where playback should be by the time a command arrives, assuming it took
/// half the round trip to get here.
pub fn compensate(position: f64, speed: f64, playing: bool, rtt: Option<Duration>) -> f64 {
    match (playing, rtt) {
        (true, Some(rtt)) => position + rtt.as_secs_f64() / 2.0 * speed,
        _ => position,
    }
}
