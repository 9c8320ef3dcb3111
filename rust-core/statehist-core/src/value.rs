// SPDX-License-Identifier: PMPL-1.0-or-later
//
// State values: the tagged union an attribute holds over an interval.
//
// Equality is structural with one twist: doubles compare by bit pattern, so
// `NaN == NaN` and `0.0 != -0.0`. The builder relies on this equality to
// coalesce repeated writes of the same value into one interval.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::ByteReader;
use crate::error::{ValueError, ValueResult};

/// Type tag of a [`StateValue`], stored as the first byte of its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Int,
    Long,
    Double,
    String,
    Custom,
}

impl ValueType {
    /// Decode a type tag byte.
    pub fn from_byte(byte: u8) -> ValueResult<Self> {
        match byte {
            0 => Ok(Self::Null),
            1 => Ok(Self::Int),
            2 => Ok(Self::Long),
            3 => Ok(Self::Double),
            4 => Ok(Self::String),
            5 => Ok(Self::Custom),
            other => Err(ValueError::InvalidTypeTag(other)),
        }
    }

    /// Encode this type as its tag byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int => 1,
            Self::Long => 2,
            Self::Double => 3,
            Self::String => 4,
            Self::Custom => 5,
        }
    }

    /// Lower-case name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value held by an attribute during an interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StateValue {
    /// The attribute holds no value.
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    /// Opaque payload produced by a state provider.
    Custom(Vec<u8>),
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl StateValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Null => ValueType::Null,
            Self::Int(_) => ValueType::Int,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
            Self::Custom(_) => ValueType::Custom,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view, widening `Int` to `i64`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&[u8]> {
        match self {
            Self::Custom(v) => Some(v),
            _ => None,
        }
    }

    /// Number of bytes [`StateValue::encode_into`] appends.
    pub fn size_on_disk(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Int(_) => 4,
            Self::Long(_) | Self::Double(_) => 8,
            Self::String(s) => 2 + s.len(),
            Self::Custom(c) => 2 + c.len(),
        }
    }

    /// Append the binary encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> ValueResult<()> {
        out.push(self.value_type().to_byte());
        match self {
            Self::Null => {}
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Self::String(s) => encode_payload(s.as_bytes(), out)?,
            Self::Custom(c) => encode_payload(c, out)?,
        }
        Ok(())
    }

    /// Decode one value from the reader's current position.
    pub fn decode(reader: &mut ByteReader<'_>) -> ValueResult<Self> {
        let value = match ValueType::from_byte(reader.u8()?)? {
            ValueType::Null => Self::Null,
            ValueType::Int => Self::Int(reader.i32()?),
            ValueType::Long => Self::Long(reader.i64()?),
            ValueType::Double => Self::Double(reader.f64()?),
            ValueType::String => {
                let len = usize::from(reader.u16()?);
                let raw = reader.bytes(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| ValueError::InvalidUtf8)?;
                Self::String(s.to_owned())
            }
            ValueType::Custom => {
                let len = usize::from(reader.u16()?);
                Self::Custom(reader.bytes(len)?.to_vec())
            }
        };
        Ok(value)
    }
}

fn encode_payload(payload: &[u8], out: &mut Vec<u8>) -> ValueResult<()> {
    let len = u16::try_from(payload.len()).map_err(|_| ValueError::PayloadTooLarge(payload.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Custom(c) => write!(f, "<custom {} bytes>", c.len()),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
