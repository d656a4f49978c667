// Core identity types for the room protocol.
//
// These are shared by the relay's directory (`tavern_relay::directory`) and
// the peer's connection state (`tavern_peer::connection`). A `PlayerId` is a
// relay-scoped identifier: it exists for exactly one live connection and is
// never persisted — a peer that reconnects receives a fresh one.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Relay-assigned peer ID. One per live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Player color. Unique within a room; doubles as the player's visual
/// identity on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Color {
    Blue,
    Red,
    White,
    Orange,
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Blue => "BLUE",
            Self::Red => "RED",
            Self::White => "WHITE",
            Self::Orange => "ORANGE",
        };
        f.write_str(name)
    }
}

/// Total length of a room code, separator included.
pub const CODE_LENGTH: usize = 7;

/// Index of the single `-` separator within a room code.
pub const SEPARATOR_OFFSET: usize = 3;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A validated room code: six alphanumeric symbols rendered as
/// `XXX-XXX`. Values are only constructed through [`RoomCode::parse`] or
/// [`RoomCode::generate`], so holding a `RoomCode` implies the shape
/// invariant holds. Wire messages carry plain strings; the relay parses
/// them before any directory lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate an externally supplied code against the shape invariant.
    pub fn parse(code: &str) -> Option<Self> {
        if code.len() != CODE_LENGTH {
            return None;
        }
        let valid = code.bytes().enumerate().all(|(i, b)| {
            if i == SEPARATOR_OFFSET {
                b == b'-'
            } else {
                b.is_ascii_uppercase() || b.is_ascii_digit()
            }
        });
        valid.then(|| Self(code.to_owned()))
    }

    /// Generate a random, well-shaped room code. Uniqueness is checked by
    /// the directory on insertion, not here — the code space is large
    /// enough that collisions are rare and retryable.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut code = String::with_capacity(CODE_LENGTH);
        for i in 0..CODE_LENGTH {
            if i == SEPARATOR_OFFSET {
                code.push('-');
            } else {
                let idx = rng.random_range(0..CODE_ALPHABET.len());
                code.push(CODE_ALPHABET[idx] as char);
            }
        }
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_well_shaped_codes() {
        assert!(RoomCode::parse("ABC-123").is_some());
        assert!(RoomCode::parse("000-ZZZ").is_some());
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(RoomCode::parse("AB-123").is_none());
        assert!(RoomCode::parse("ABCD-123").is_none());
        assert!(RoomCode::parse("").is_none());
    }

    #[test]
    fn parse_rejects_misplaced_separator() {
        assert!(RoomCode::parse("AB-C123").is_none());
        assert!(RoomCode::parse("ABC1-23").is_none());
        assert!(RoomCode::parse("ABC1234").is_none());
    }

    #[test]
    fn parse_rejects_bad_symbols() {
        assert!(RoomCode::parse("abc-123").is_none());
        assert!(RoomCode::parse("AB?-123").is_none());
        assert!(RoomCode::parse("ABC-12 ").is_none());
    }

    #[test]
    fn generated_codes_are_well_shaped() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let code = RoomCode::generate(&mut rng);
            assert!(RoomCode::parse(code.as_str()).is_some(), "bad code: {code}");
        }
    }

    #[test]
    fn color_wire_names_are_screaming_case() {
        let json = serde_json::to_string(&Color::Orange).unwrap();
        assert_eq!(json, "\"ORANGE\"");
        let back: Color = serde_json::from_str("\"BLUE\"").unwrap();
        assert_eq!(back, Color::Blue);
    }
}
