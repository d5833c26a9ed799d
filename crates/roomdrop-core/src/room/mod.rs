//! Room id generation and validation.
//!
//! Rooms are addressed by 6-digit decimal ids (`100000` - `999999`), short
//! enough to read out loud and type on a phone keypad.
//!
//! ## Example
//!
//! ```rust,ignore
//! use roomdrop_core::room::{RoomId, RoomIdGenerator};
//!
//! let id = RoomIdGenerator::new().generate();
//! let parsed = RoomId::parse(" 482913 ")?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a room id
pub const ROOM_ID_LENGTH: usize = 6;

/// Smallest valid room id
pub const ROOM_ID_MIN: u32 = 100_000;

/// Largest valid room id
pub const ROOM_ID_MAX: u32 = 999_999;

/// Attempts a single generation pass makes before giving up
pub const MAX_GENERATION_ATTEMPTS: usize = 64;

/// A validated room id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId {
    id: String,
}

impl RoomId {
    /// Parse and validate a room id from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a 6-digit number in the valid range.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim();

        if normalized.len() != ROOM_ID_LENGTH {
            return Err(Error::InvalidRoomId(format!(
                "room id must be {} digits, got {}",
                ROOM_ID_LENGTH,
                normalized.len()
            )));
        }

        if let Some(c) = normalized.chars().find(|c| !c.is_ascii_digit()) {
            return Err(Error::InvalidRoomId(format!(
                "invalid character '{c}' in room id"
            )));
        }

        let value: u32 = normalized
            .parse()
            .map_err(|e| Error::InvalidRoomId(format!("{e}")))?;
        if value < ROOM_ID_MIN {
            return Err(Error::InvalidRoomId(format!(
                "room id must not start with 0: {normalized}"
            )));
        }

        Ok(Self {
            id: normalized.to_string(),
        })
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl TryFrom<String> for RoomId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.id
    }
}

impl std::str::FromStr for RoomId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Generator for room ids.
#[derive(Debug, Default)]
pub struct RoomIdGenerator;

impl RoomIdGenerator {
    /// Create a new room id generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generate a random room id.
    #[must_use]
    pub fn generate(&self) -> RoomId {
        let value = rand::thread_rng().gen_range(ROOM_ID_MIN..=ROOM_ID_MAX);
        RoomId {
            id: value.to_string(),
        }
    }

    /// Generate a room id for which `is_taken` returns false.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomIdCollision`] if no free id was drawn within
    /// [`MAX_GENERATION_ATTEMPTS`] attempts.
    pub fn generate_unique<F>(&self, mut is_taken: F) -> Result<RoomId>
    where
        F: FnMut(&RoomId) -> bool,
    {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let id = self.generate();
            if !is_taken(&id) {
                return Ok(id);
            }
        }
        Err(Error::RoomIdCollision)
    }
}
