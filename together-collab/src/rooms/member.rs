use std::time::Duration;

use tokio::time::Instant;
use together_core::{random_string, ClipId, MemberId, MemberInfo};

/// A participant in a room. Survives disconnects for the reconnect grace.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    /// Secret used to open sessions and transfer clips
    pub token: String,
    pub handle: String,
    pub joined_at: Instant,
    pub liveness: Liveness,
    pub latency: Latency,
    /// Clips this member uploaded, which make up its part of the shared pool
    pub contributed: Vec<ClipId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connected,
    Disconnected { since: Instant },
}

/// Round-trip latency from liveness probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latency {
    pub last: Option<Duration>,
    pub smoothed: Option<Duration>,
}

impl Member {
    const TOKEN_LENGTH: usize = 32;

    /// A new member starts out disconnected until its session attaches.
    pub fn new(handle: String, now: Instant) -> Self {
        Self {
            id: MemberId::new(),
            token: random_string(Self::TOKEN_LENGTH),
            handle,
            joined_at: now,
            liveness: Liveness::Disconnected { since: now },
            latency: Latency::default(),
            contributed: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.liveness == Liveness::Connected
    }

    /// How long this member has been gone, if it is.
    pub fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        match self.liveness {
            Liveness::Connected => None,
            Liveness::Disconnected { since } => Some(now.saturating_duration_since(since)),
        }
    }

    pub fn info(&self, host: Option<MemberId>) -> MemberInfo {
        MemberInfo {
            id: self.id,
            handle: self.handle.clone(),
            host: host == Some(self.id),
            connected: self.is_connected(),
            latency_ms: self.latency.smoothed.map(|d| d.as_millis() as u64),
        }
    }
}

impl Latency {
    /// Weight of the newest sample in the rolling estimate
    const SMOOTHING: f64 = 0.2;

    pub fn record(&mut self, sample: Duration) {
        self.last = Some(sample);
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(previous) => Duration::from_secs_f64(
                previous.as_secs_f64() * (1.0 - Self::SMOOTHING)
                    + sample.as_secs_f64() * Self::SMOOTHING,
            ),
        });
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Latency;

    #[test]
    fn latency_is_smoothed() {
        let mut latency = Latency::default();

        latency.record(Duration::from_millis(100));
        assert_eq!(latency.smoothed, Some(Duration::from_millis(100)));

        latency.record(Duration::from_millis(200));
        assert_eq!(latency.last, Some(Duration::from_millis(200)));

        let smoothed = latency.smoothed.unwrap().as_secs_f64();
        assert!((smoothed - 0.12).abs() < 1e-9);
    }
}
