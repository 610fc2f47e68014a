use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    time::Duration,
};

use argon2::{
    password_hash::{Encoding, SaltString},
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
};
use log::warn;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::time::Instant;
use together_core::PasswordCost;

use crate::RoomError;

/// Hashes and verifies room passwords.
///
/// Both operations are deliberately slow, so callers run them off the async
/// executor with `spawn_blocking`.
#[derive(Clone)]
pub struct PasswordGuard {
    argon: Argon2<'static>,
}

impl PasswordGuard {
    pub fn new(cost: PasswordCost) -> Self {
        let params = Params::new(cost.memory_kib, cost.iterations, 1, None).unwrap_or_else(|e| {
            warn!("Invalid password cost {:?} ({}), using defaults", cost, e);
            Params::default()
        });

        Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Hashes a password with a fresh salt, returning the PHC string.
    pub fn hash(&self, password: &str) -> Result<String, RoomError> {
        let salt = SaltString::generate(&mut OsRng);

        Ok(self
            .argon
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| RoomError::Hash(e.to_string()))?
            .to_string())
    }

    pub fn verify(&self, password: &str, hash: &str) -> Result<(), RoomError> {
        let stored = PasswordHash::parse(hash, Encoding::default())
            .map_err(|e| RoomError::Hash(e.to_string()))?;

        self.argon
            .verify_password(password.as_bytes(), &stored)
            .map_err(|_| RoomError::WrongPassword)
    }
}

/// Sliding-window limit on join attempts per address.
pub struct JoinLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl JoinLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: Default::default(),
        }
    }

    /// Records an attempt from `ip`, unless it already used up its window.
    /// Rejected attempts are not recorded.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), RoomError> {
        let mut attempts = self.attempts.lock();
        let history = attempts.entry(ip).or_default();

        prune(history, self.window, now);

        if history.len() >= self.max_attempts {
            return Err(RoomError::RateLimited);
        }

        history.push_back(now);
        Ok(())
    }

    /// Drops every expired attempt, and addresses left without any.
    pub fn prune_all(&self, now: Instant) {
        let mut attempts = self.attempts.lock();

        attempts.retain(|_, history| {
            prune(history, self.window, now);
            !history.is_empty()
        });
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.attempts.lock().len()
    }
}

fn prune(history: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(oldest) = history.front() {
        if now.saturating_duration_since(*oldest) < window {
            break;
        }

        history.pop_front();
    }
}

#[cfg(test)]
mod test {
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    use tokio::time::Instant;
    use together_core::{ErrorKind, PasswordCost};

    use super::{JoinLimiter, PasswordGuard};

    const CHEAP: PasswordCost = PasswordCost {
        memory_kib: 8,
        iterations: 1,
    };

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn passwords_verify_against_their_hash() {
        let guard = PasswordGuard::new(CHEAP);
        let hash = guard.hash("popcorn").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(guard.verify("popcorn", &hash).is_ok());

        let err = guard.verify("Popcorn", &hash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn same_password_gets_different_salts() {
        let guard = PasswordGuard::new(CHEAP);
        assert_ne!(guard.hash("x").unwrap(), guard.hash("x").unwrap());
    }

    #[test]
    fn sixth_attempt_in_window_is_limited() {
        let limiter = JoinLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..5 {
            limiter
                .check(ip(1), start + Duration::from_secs(i))
                .unwrap();
        }

        let err = limiter
            .check(ip(1), start + Duration::from_secs(30))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        // Other addresses are unaffected
        assert!(limiter.check(ip(2), start + Duration::from_secs(30)).is_ok());

        // Once the first attempts leave the window, the address may try again
        assert!(limiter.check(ip(1), start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn pruning_forgets_idle_addresses() {
        let limiter = JoinLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        limiter.check(ip(1), start).unwrap();
        limiter.check(ip(2), start + Duration::from_secs(30)).unwrap();
        assert_eq!(limiter.tracked(), 2);

        limiter.prune_all(start + Duration::from_secs(61));
        assert_eq!(limiter.tracked(), 1);

        limiter.prune_all(start + Duration::from_secs(91));
        assert_eq!(limiter.tracked(), 0);
    }
}
