use std::fmt::Display;

use lazy_static::lazy_static;
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ROOM_CODE: Regex =
        Regex::new(r"^[A-Z]{5}-[0-9]{5}-[A-Z]{5}$").expect("room code pattern compiles");
}

/// A human-shareable room code such as `QWERT-12345-ASDFG`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    const GROUP_LEN: usize = 5;

    /// Generates a random code. Collision checks are the caller's job.
    pub fn generate() -> Self {
        let mut rng = thread_rng();

        let mut group = |alphabet: &[u8]| -> String {
            (0..Self::GROUP_LEN)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
                .collect()
        };

        let letters = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let digits = b"0123456789";

        let head = group(letters);
        let middle = group(digits);
        let tail = group(letters);

        Self(format!("{head}-{middle}-{tail}"))
    }

    /// Parses user input, accepting lowercase and surrounding whitespace.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();

        ROOM_CODE
            .is_match(&normalized)
            .then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::RoomCode;

    #[test]
    fn generated_codes_parse() {
        for _ in 0..100 {
            let code = RoomCode::generate();
            assert_eq!(RoomCode::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn parse_normalizes_and_rejects_garbage() {
        assert_eq!(
            RoomCode::parse("  abcde-12345-fghij ").map(|c| c.to_string()),
            Some("ABCDE-12345-FGHIJ".to_string())
        );
        assert_eq!(RoomCode::parse("ABCDE-1234-FGHIJ"), None);
        assert_eq!(RoomCode::parse("../../etc/passwd"), None);
        assert_eq!(RoomCode::parse(""), None);
    }
}
