use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 8765;

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

/// What happens when the host is gone for longer than the reconnect grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSuccession {
    /// Hand the room to the most senior remaining member
    #[default]
    Promote,
    /// Pause the room and wait for the host to come back
    Freeze,
}

/// What happens to playback commands sent by guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuestPolicy {
    /// Answer with a `forbidden` error
    #[default]
    Reject,
    /// Pass the request on to the host, who may act on it
    Forward,
}

/// Cost parameters of the password hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

/// The configuration of a together server
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Where uploaded clips are stored, one directory per room
    pub upload_dir: PathBuf,
    /// Per-file upload ceiling in bytes
    pub max_file_size: u64,
    /// Ceiling for all stored clips together, if any
    pub max_storage: Option<u64>,
    /// How long a room may go without activity before it is deleted
    pub room_inactivity: Duration,
    /// How often expired rooms are swept
    pub sweep_interval: Duration,
    pub max_rooms: usize,
    /// Join attempts allowed per address within `join_window`
    pub max_join_attempts: usize,
    pub join_window: Duration,
    /// How often connections are probed for liveness
    pub probe_interval: Duration,
    /// How long a probe may go unanswered before the connection is dropped
    pub probe_timeout: Duration,
    /// How long a disconnected member keeps its seat
    pub reconnect_grace: Duration,
    /// How long a new session has to authenticate
    pub auth_timeout: Duration,
    /// When the host is told about members stalling a ready-sync round
    pub ready_timeout: Option<Duration>,
    pub host_succession: HostSuccession,
    pub guest_requests: GuestPolicy,
    pub password_cost: PasswordCost,
}

impl Config {
    /// Builds a config from `TOGETHER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from whatever `lookup` returns for each `TOGETHER_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source = Source(lookup);
        let defaults = Self::default();

        let ready_timeout_secs = source.var(
            "TOGETHER_READY_TIMEOUT_SECONDS",
            defaults.ready_timeout.map(|d| d.as_secs()).unwrap_or(0),
        )?;

        let config = Self {
            host: source.var("TOGETHER_HOST", defaults.host)?,
            port: source.var("TOGETHER_PORT", defaults.port)?,
            upload_dir: source.var("TOGETHER_UPLOAD_DIR", defaults.upload_dir)?,
            max_file_size: source
                .megabytes("TOGETHER_MAX_FILE_SIZE_MB", defaults.max_file_size / MEGABYTE)?,
            max_storage: match source.megabytes("TOGETHER_MAX_STORAGE_MB", 0)? {
                0 => None,
                bytes => Some(bytes),
            },
            room_inactivity: source.seconds(
                "TOGETHER_ROOM_EXPIRY_SECONDS",
                defaults.room_inactivity,
            )?,
            sweep_interval: source
                .seconds("TOGETHER_SWEEP_INTERVAL_SECONDS", defaults.sweep_interval)?,
            max_rooms: source.var("TOGETHER_MAX_ROOMS", defaults.max_rooms)?,
            max_join_attempts: defaults.max_join_attempts,
            join_window: defaults.join_window,
            probe_interval: defaults.probe_interval,
            probe_timeout: defaults.probe_timeout,
            reconnect_grace: source.seconds(
                "TOGETHER_RECONNECT_GRACE_SECONDS",
                defaults.reconnect_grace,
            )?,
            auth_timeout: defaults.auth_timeout,
            ready_timeout: (ready_timeout_secs > 0).then(|| Duration::from_secs(ready_timeout_secs)),
            host_succession: source.var("TOGETHER_HOST_SUCCESSION", defaults.host_succession)?,
            guest_requests: source.var("TOGETHER_GUEST_REQUESTS", defaults.guest_requests)?,
            password_cost: PasswordCost {
                memory_kib: source.var(
                    "TOGETHER_PASSWORD_MEMORY_KIB",
                    defaults.password_cost.memory_kib,
                )?,
                iterations: source.var(
                    "TOGETHER_PASSWORD_ITERATIONS",
                    defaults.password_cost.iterations,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the values the background timers and the store rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("TOGETHER_ROOM_EXPIRY_SECONDS", self.room_inactivity),
            ("TOGETHER_SWEEP_INTERVAL_SECONDS", self.sweep_interval),
            ("probe_interval", self.probe_interval),
            ("join_window", self.join_window),
        ];

        for (key, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                });
            }
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::Invalid {
                key: "TOGETHER_MAX_FILE_SIZE_MB",
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            upload_dir: PathBuf::from("./uploads"),
            max_file_size: 500 * MEGABYTE,
            max_storage: None,
            // Long enough for a movie night
            room_inactivity: Duration::from_secs(4 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            max_rooms: 1000,
            max_join_attempts: 5,
            join_window: Duration::from_secs(60),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(15),
            reconnect_grace: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            ready_timeout: Some(Duration::from_secs(30)),
            host_succession: HostSuccession::default(),
            guest_requests: GuestPolicy::default(),
            // Argon2 defaults
            password_cost: PasswordCost {
                memory_kib: 19 * 1024,
                iterations: 2,
            },
        }
    }
}

impl FromStr for HostSuccession {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "promote" => Ok(Self::Promote),
            "freeze" => Ok(Self::Freeze),
            _ => Err(()),
        }
    }
}

impl FromStr for GuestPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "forward" => Ok(Self::Forward),
            _ => Err(()),
        }
    }
}

struct Source<F>(F);

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn var<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.0)(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.var(key, default.as_secs()).map(Duration::from_secs)
    }

    fn megabytes(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        let megabytes = self.var(key, default)?;

        megabytes
            .checked_mul(MEGABYTE)
            .ok_or_else(|| ConfigError::Invalid {
                key,
                value: megabytes.to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, time::Duration};

    use super::{Config, ConfigError, GuestPolicy, HostSuccession};

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<_, _> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let config = config_from(&[
            ("TOGETHER_MAX_FILE_SIZE_MB", "2"),
            ("TOGETHER_HOST_SUCCESSION", "freeze"),
        ])
        .unwrap();

        assert_eq!(config.max_file_size, 2 * 1024 * 1024);
        assert_eq!(config.max_storage, None);
        assert_eq!(config.host_succession, HostSuccession::Freeze);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn zero_periods_are_refused() {
        let err = config_from(&[("TOGETHER_SWEEP_INTERVAL_SECONDS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TOGETHER_SWEEP_INTERVAL_SECONDS",
                ..
            }
        ));

        assert!(config_from(&[("TOGETHER_ROOM_EXPIRY_SECONDS", "0")]).is_err());
    }

    #[test]
    fn oversized_megabytes_are_refused() {
        let huge = u64::MAX.to_string();

        let err = config_from(&[("TOGETHER_MAX_STORAGE_MB", huge.as_str())]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TOGETHER_MAX_STORAGE_MB",
                ..
            }
        ));
        assert!(config_from(&[("TOGETHER_MAX_FILE_SIZE_MB", "not a number")]).is_err());
    }

    #[test]
    fn policies_parse_case_insensitively() {
        assert_eq!("Freeze".parse(), Ok(HostSuccession::Freeze));
        assert_eq!("promote".parse(), Ok(HostSuccession::Promote));
        assert_eq!("FORWARD".parse(), Ok(GuestPolicy::Forward));
        assert!("sometimes".parse::<GuestPolicy>().is_err());
    }
}
