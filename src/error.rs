use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::{DataType, RegisterKind};

/// Exception code returned by the slave in place of a normal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ExceptionKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::NegativeAcknowledge => 0x07,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailed => 0x0B,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("Illegal function"),
            Self::IllegalDataAddress => f.write_str("Illegal data address"),
            Self::IllegalDataValue => f.write_str("Illegal data value"),
            Self::ServerDeviceFailure => f.write_str("Slave device failure"),
            Self::Acknowledge => f.write_str("Acknowledge"),
            Self::ServerDeviceBusy => f.write_str("Slave device busy"),
            Self::NegativeAcknowledge => f.write_str("Negative acknowledge"),
            Self::MemoryParityError => f.write_str("Memory parity error"),
            Self::GatewayPathUnavailable => f.write_str("Gateway path unavailable"),
            Self::GatewayTargetFailed => {
                f.write_str("Gateway target device failed to respond")
            }
            Self::Unknown(code) => write!(f, "Unknown error: {code}"),
        }
    }
}

/// Failures surfaced by [`DeviceConnection`](crate::DeviceConnection).
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Framing(String),

    #[error("slave exception 0x{code:02X}: {0}", code = .0.code())]
    Protocol(ExceptionKind),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not connected")]
    NotConnected,
}

impl ConnError {
    /// I/O level failure of an open transport.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Lost or garbled response, the stream may be out of step.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Framing(_))
    }
}

/// Register configuration invariant violations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("scale factor must be a non-zero finite number")]
    ZeroScale,

    #[error("minimum {min} must be below maximum {max}")]
    EmptyRange { min: f64, max: f64 },

    #[error("alarm limits {low}..{high} must be ordered and inside {min}..{max}")]
    AlarmLimits {
        low: f64,
        high: f64,
        min: f64,
        max: f64,
    },

    #[error("{kind} cannot hold {data_type} values")]
    KindMismatch {
        kind: RegisterKind,
        data_type: DataType,
    },

    #[error("string length of {0} registers is out of range")]
    StringLength(u16),

    #[error("register at {address} spanning {quantity} words exceeds the address space")]
    AddressOverflow { address: u16, quantity: u16 },

    #[error("unknown byte order '{0}'")]
    UnknownByteOrder(String),
}

#[derive(Debug, Clone, Error)]
pub enum RegisterError {
    #[error("register {address} is read-only")]
    ReadOnly { address: u16 },

    #[error("value {value} for register {address} is outside {min}..={max}")]
    OutOfRange {
        address: u16,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("value {value} cannot be stored as {data_type}")]
    Unrepresentable { value: f64, data_type: DataType },

    #[error("conversion failed for register {address}: {reason}")]
    Conversion { address: u16, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("register {0} already exists")]
    DuplicateRegister(u16),

    #[error("register {0} does not exist")]
    MissingRegister(u16),

    #[error("invalid configuration for register {address}: {source}")]
    Config {
        address: u16,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Connection(#[from] ConnError),

    #[error("device document: {0}")]
    Document(#[from] serde_json::Error),
}
