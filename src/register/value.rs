use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::DataType;

/// A register value tagged with its storage type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bit(bool),
    Byte(u8),
    Word(u16),
    Int16(i16),
    DWord(u32),
    DInt32(i32),
    Float32(f32),
    Float64(f64),
    String(String),
    WString(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bit(_) => DataType::Bit,
            Self::Byte(_) => DataType::Byte,
            Self::Word(_) => DataType::Word,
            Self::Int16(_) => DataType::Int16,
            Self::DWord(_) => DataType::DWord,
            Self::DInt32(_) => DataType::DInt32,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::String(_) => DataType::String,
            Self::WString(_) => DataType::WString,
        }
    }

    /// Numeric view of the value; bits read as 0/1, text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bit(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Byte(v) => Some(f64::from(*v)),
            Self::Word(v) => Some(f64::from(*v)),
            Self::Int16(v) => Some(f64::from(*v)),
            Self::DWord(v) => Some(f64::from(*v)),
            Self::DInt32(v) => Some(f64::from(*v)),
            Self::Float32(v) => Some(f64::from(*v)),
            Self::Float64(v) => Some(*v),
            Self::String(s) | Self::WString(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bit(b) => Some(*b),
            Self::String(s) | Self::WString(s) => match s.trim() {
                "1" | "true" | "on" => Some(true),
                "0" | "false" | "off" => Some(false),
                _ => None,
            },
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::WString(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit(b) => write!(f, "{}", u8::from(*b)),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Word(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::DWord(v) => write!(f, "{v}"),
            Self::DInt32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(s) | Self::WString(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bit(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Word(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::DWord(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::DInt32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
