mod id;

pub use id::*;

use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Returns a random alphanumeric string, used for member tokens.
pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Milliseconds since the unix epoch, attached to broadcasts so clients can
/// estimate how stale a command is.
pub fn server_time() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
