//! State values stored in the history.
//!
//! A [`StateValue`] is the payload recorded for an attribute over an
//! interval of time. Each attribute keeps values of a single [`ValueKind`]
//! while it holds non-null values; null is accepted everywhere.

use crate::error::{Result, StateError};
use std::fmt;

/// Kind tag of a [`StateValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ValueKind {
    /// No information.
    #[default]
    Null = 0,
    /// 32-bit signed integer.
    Int = 1,
    /// 64-bit signed integer.
    Long = 2,
    /// 64-bit float.
    Double = 3,
    /// UTF-8 string.
    Str = 4,
    /// Opaque byte payload.
    Custom = 5,
}

impl ValueKind {
    /// Creates a ValueKind from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Double),
            4 => Some(Self::Str),
            5 => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Str => "string",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A value held by an attribute over an interval.
#[derive(Debug, Clone, Default)]
pub enum StateValue {
    /// No information.
    #[default]
    Null,
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte payload.
    Custom(Vec<u8>),
}

// Doubles compare bitwise so a repeated NaN does not split an interval.
impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl StateValue {
    /// Returns the kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
            Self::Custom(_) => ValueKind::Custom,
        }
    }

    /// Returns true if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the long payload, if this is a `Long`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the double payload, if this is a `Double`.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Serializes the value: one kind byte followed by the little-endian
    /// payload. Strings and custom payloads are length-prefixed (u32).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind() as u8);
        match self {
            Self::Null => {}
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Custom(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Deserializes a value written by [`StateValue::encode`].
    ///
    /// Returns the value and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` on an unknown kind, a truncated
    /// payload or a string that is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| StateError::Corrupted("empty state value".to_string()))?;
        let kind = ValueKind::from_u8(tag)
            .ok_or_else(|| StateError::Corrupted(format!("unknown value kind {}", tag)))?;

        let value = match kind {
            ValueKind::Null => return Ok((Self::Null, 1)),
            ValueKind::Int => Self::Int(i32::from_le_bytes(fixed(rest)?)),
            ValueKind::Long => Self::Long(i64::from_le_bytes(fixed(rest)?)),
            ValueKind::Double => Self::Double(f64::from_le_bytes(fixed(rest)?)),
            ValueKind::Str | ValueKind::Custom => {
                let len = u32::from_le_bytes(fixed(rest)?) as usize;
                let payload = rest
                    .get(4..4 + len)
                    .ok_or_else(|| StateError::Corrupted("truncated value payload".to_string()))?;
                let value = if kind == ValueKind::Str {
                    let s = std::str::from_utf8(payload)
                        .map_err(|e| StateError::Corrupted(format!("invalid UTF-8 value: {}", e)))?;
                    Self::Str(s.to_string())
                } else {
                    Self::Custom(payload.to_vec())
                };
                return Ok((value, 1 + 4 + len));
            }
        };

        let consumed = match kind {
            ValueKind::Int => 1 + 4,
            _ => 1 + 8,
        };
        Ok((value, consumed))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StateError::Corrupted("truncated value payload".to_string()))
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Str(s) => f.write_str(s),
            Self::Custom(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}
