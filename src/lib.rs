//! Polling client for Modbus PLCs.
//!
//! A [`DeviceConnection`] owns one session and a FIFO request queue, a
//! [`RegisterModel`] holds one typed and scaled value, and a [`Device`]
//! ties a connection to its registers and polls them on an interval.

pub mod connection;
pub mod device;
pub mod error;
pub mod register;
pub mod types;

pub use connection::{
    ConnectionEvent, ConnectionState, DeviceConnection, Request, Response, Statistics, Timing,
    WritePayload,
};
pub use device::{Device, DeviceDocument, DeviceEvent};
pub use error::{ConfigError, ConnError, DeviceError, ExceptionKind, RegisterError};
pub use register::{RegisterEvent, RegisterModel, Value};
pub use types::{
    ByteOrder, ConnectionParams, DataType, ErrorRecoveryMode, Parity, RegisterConfig,
    RegisterKind, TransportKind,
};
