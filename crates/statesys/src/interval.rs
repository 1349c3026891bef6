//! State intervals: a value held by one attribute over a closed time span.

use crate::value::StateValue;
use crate::{Quark, Timestamp};
use std::fmt;

/// End time of an interval that is still ongoing in the transient state.
pub const UNKNOWN_END: Timestamp = Timestamp::MAX;

/// A closed time span `[start, end]` during which `quark` held `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInterval {
    /// First timestamp covered (inclusive).
    pub start: Timestamp,
    /// Last timestamp covered (inclusive), or [`UNKNOWN_END`] if ongoing.
    pub end: Timestamp,
    /// Attribute this interval belongs to.
    pub quark: Quark,
    /// Value held over the interval.
    pub value: StateValue,
}

impl StateInterval {
    /// Creates a new interval.
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Self {
        Self {
            start,
            end,
            quark,
            value,
        }
    }

    /// Creates a null-valued interval, used to fill gaps in query answers.
    pub fn null(start: Timestamp, end: Timestamp, quark: Quark) -> Self {
        Self::new(start, end, quark, StateValue::Null)
    }

    /// Returns true if `t` lies within `[start, end]`.
    pub fn intersects(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns true if this interval comes from the transient state and has
    /// no known end yet.
    pub fn is_ongoing(&self) -> bool {
        self.end == UNKNOWN_END
    }

    /// Serializes the interval (start, end, quark little-endian, then the
    /// encoded value).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.end.to_le_bytes());
        out.extend_from_slice(&self.quark.to_le_bytes());
        self.value.encode(out);
    }

    /// Deserializes an interval written by [`StateInterval::encode`].
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` if the buffer is truncated or holds
    /// trailing bytes.
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        use crate::error::StateError;

        if bytes.len() < 20 {
            return Err(StateError::Corrupted(format!(
                "interval record too short: {} bytes",
                bytes.len()
            )));
        }
        let start = i64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
        let end = i64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
        let quark = i32::from_le_bytes(bytes[16..20].try_into().unwrap_or_default());
        let (value, used) = StateValue::decode(&bytes[20..])?;
        if 20 + used != bytes.len() {
            return Err(StateError::Corrupted(format!(
                "interval record has {} trailing bytes",
                bytes.len() - 20 - used
            )));
        }
        Ok(Self::new(start, end, quark, value))
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ongoing() {
            write!(f, "[{}, ...] q{} = {}", self.start, self.quark, self.value)
        } else {
            write!(
                f,
                "[{}, {}] q{} = {}",
                self.start, self.end, self.quark, self.value
            )
        }
    }
}
