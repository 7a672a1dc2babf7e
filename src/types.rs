use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;

/// Wire framing and link the connection is opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    RtuOverTcp,
    RtuOverUdp,
    RtuSerial,
    AsciiSerial,
}

impl TransportKind {
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::RtuSerial | Self::AsciiSerial)
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp | Self::RtuOverUdp)
    }

    pub fn uses_rtu_framing(&self) -> bool {
        !matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::RtuOverTcp => "RTU over TCP",
            Self::RtuOverUdp => "RTU over UDP",
            Self::RtuSerial => "RTU serial",
            Self::AsciiSerial => "ASCII serial",
        };
        f.write_str(s)
    }
}

/// PLC data types a register can be decoded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    Bit,
    Byte,
    #[default]
    Word,
    Int16,
    DWord,
    DInt32,
    Float32,
    Float64,
    String,
    WString,
}

impl DataType {
    /// Number of 16-bit registers (or bits, for `Bit`) the type occupies.
    pub fn register_count(&self, string_length: u16) -> u16 {
        match self {
            Self::Bit | Self::Byte | Self::Word | Self::Int16 => 1,
            Self::DWord | Self::DInt32 | Self::Float32 => 2,
            Self::Float64 => 4,
            Self::String | Self::WString => string_length,
        }
    }

    /// Width in bytes of the types byte order applies to.
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            Self::Word | Self::Int16 => Some(2),
            Self::DWord | Self::DInt32 | Self::Float32 => Some(4),
            Self::Float64 => Some(8),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::String | Self::WString)
    }

    /// Scaling, range checks and alarms only apply to numeric types.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Bit | Self::String | Self::WString)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Word | Self::Int16 | Self::DWord | Self::DInt32
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Representable range of the storage type.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Byte => Some((0.0, u8::MAX as f64)),
            Self::Word => Some((0.0, u16::MAX as f64)),
            Self::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Self::DWord => Some((0.0, u32::MAX as f64)),
            Self::DInt32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Self::Float32 => Some((f32::MIN as f64, f32::MAX as f64)),
            Self::Float64 => Some((f64::MIN, f64::MAX)),
            Self::Bit | Self::String | Self::WString => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bit => "BIT",
            Self::Byte => "BYTE",
            Self::Word => "WORD",
            Self::Int16 => "INT16",
            Self::DWord => "DWORD",
            Self::DInt32 => "DINT32",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::String => "STRING",
            Self::WString => "WSTRING",
        };
        f.write_str(s)
    }
}

/// Modbus data table a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    #[default]
    HoldingRegister,
}

impl RegisterKind {
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    pub fn max_read_quantity(&self) -> u16 {
        if self.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    pub fn max_write_quantity(&self) -> u16 {
        if self.is_bit() {
            MAX_WRITE_BITS
        } else {
            MAX_WRITE_REGISTERS
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete input",
            Self::InputRegister => "input register",
            Self::HoldingRegister => "holding register",
        };
        f.write_str(s)
    }
}

/// Word and byte arrangement of multi-byte values on the wire.
///
/// Variants are named after the byte sequence a 32-bit value `ABCD` takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Straight big-endian.
    #[default]
    #[serde(alias = "AB_CD", alias = "ABCD")]
    AbCd,
    /// Word swapped.
    #[serde(alias = "CD_AB", alias = "CDAB")]
    CdAb,
    /// Bytes swapped inside each word.
    #[serde(alias = "BA_DC", alias = "BADC")]
    BaDc,
    /// Fully reversed, little-endian.
    #[serde(alias = "DC_BA", alias = "DCBA")]
    DcBa,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AbCd => "AB CD",
            Self::CdAb => "CD AB",
            Self::BaDc => "BA DC",
            Self::DcBa => "DC BA",
        };
        f.write_str(s)
    }
}

impl FromStr for ByteOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" => Ok(Self::AbCd),
            "CDAB" => Ok(Self::CdAb),
            "BADC" => Ok(Self::BaDc),
            "DCBA" => Ok(Self::DcBa),
            _ => Err(ConfigError::UnknownByteOrder(s.to_string())),
        }
    }
}

/// How the connection reacts to a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorRecoveryMode {
    None,
    /// Reopen the link after an I/O failure.
    Link,
    /// Reopen the link after a timeout or a malformed frame.
    Protocol,
    #[default]
    LinkAndProtocol,
}

impl ErrorRecoveryMode {
    pub fn recovers_link(&self) -> bool {
        matches!(self, Self::Link | Self::LinkAndProtocol)
    }

    pub fn recovers_protocol(&self) -> bool {
        matches!(self, Self::Protocol | Self::LinkAndProtocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
}

/// Session configuration handed to [`DeviceConnection::connect`](crate::DeviceConnection::connect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub name: String,
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub scan_rate_ms: u64,
    pub retry_count: u32,
    pub byte_order: ByteOrder,
    pub read_write_enabled: bool,
    pub error_recovery: ErrorRecoveryMode,
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: TransportKind::Tcp,
            host: String::from("127.0.0.1"),
            port: 502,
            unit_id: 1,
            timeout_ms: 1000,
            scan_rate_ms: 1000,
            retry_count: 3,
            byte_order: ByteOrder::AbCd,
            read_write_enabled: true,
            error_recovery: ErrorRecoveryMode::LinkAndProtocol,
            serial_port: String::new(),
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl ConnectionParams {
    pub fn tcp(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            ..Self::default()
        }
    }

    pub fn serial(port: impl Into<String>, baud_rate: u32, unit_id: u8) -> Self {
        Self {
            kind: TransportKind::RtuSerial,
            serial_port: port.into(),
            baud_rate,
            unit_id,
            ..Self::default()
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn scan_rate(&self) -> Duration {
        Duration::from_millis(self.scan_rate_ms)
    }

    /// Silence tolerated before the watchdog forces a reconnect.
    pub fn silence_limit(&self) -> Duration {
        self.response_timeout() * self.retry_count.max(1)
    }

    pub fn endpoint(&self) -> String {
        if self.kind.is_serial() {
            self.serial_port.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One register's configuration. Address, data type and kind are fixed once a
/// register is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub address: u16,
    pub name: String,
    pub description: String,
    pub data_type: DataType,
    pub kind: RegisterKind,
    pub scale_factor: f64,
    pub unit: String,
    pub min_value: f64,
    pub max_value: f64,
    pub read_only: bool,
    pub alarm_enabled: bool,
    pub alarm_low: f64,
    pub alarm_high: f64,
    pub byte_order: ByteOrder,
    /// Registers occupied by `String`/`WString` values.
    pub string_length: u16,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            address: 0,
            name: String::new(),
            description: String::new(),
            data_type: DataType::Word,
            kind: RegisterKind::HoldingRegister,
            scale_factor: 1.0,
            unit: String::new(),
            min_value: 0.0,
            max_value: 65535.0,
            read_only: false,
            alarm_enabled: false,
            alarm_low: 0.0,
            alarm_high: 0.0,
            byte_order: ByteOrder::AbCd,
            string_length: 8,
        }
    }
}

impl RegisterConfig {
    pub fn new(address: u16, data_type: DataType, kind: RegisterKind) -> Self {
        let mut config = Self {
            address,
            data_type,
            kind,
            ..Self::default()
        };
        if let Some((min, max)) = data_type.bounds() {
            config.min_value = min;
            config.max_value = max;
        }
        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_scale(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_range(mut self, min_value: f64, max_value: f64) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    pub fn with_alarm(mut self, low: f64, high: f64) -> Self {
        self.alarm_enabled = true;
        self.alarm_low = low;
        self.alarm_high = high;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_string_length(mut self, registers: u16) -> Self {
        self.string_length = registers;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn quantity(&self) -> u16 {
        self.data_type.register_count(self.string_length)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scale_factor == 0.0 || !self.scale_factor.is_finite() {
            return Err(ConfigError::ZeroScale);
        }
        if !(self.min_value < self.max_value) {
            return Err(ConfigError::EmptyRange {
                min: self.min_value,
                max: self.max_value,
            });
        }
        if self.alarm_enabled
            && !(self.alarm_low < self.alarm_high
                && self.min_value <= self.alarm_low
                && self.alarm_high <= self.max_value)
        {
            return Err(ConfigError::AlarmLimits {
                low: self.alarm_low,
                high: self.alarm_high,
                min: self.min_value,
                max: self.max_value,
            });
        }
        if self.kind.is_bit() && self.data_type != DataType::Bit {
            return Err(ConfigError::KindMismatch {
                kind: self.kind,
                data_type: self.data_type,
            });
        }
        if self.data_type.is_text()
            && (self.string_length == 0 || self.string_length > MAX_READ_REGISTERS)
        {
            return Err(ConfigError::StringLength(self.string_length));
        }
        if u32::from(self.address) + u32::from(self.quantity()) > 0x1_0000 {
            return Err(ConfigError::AddressOverflow {
                address: self.address,
                quantity: self.quantity(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_classic_poller() {
        let params = ConnectionParams::default();
        assert_eq!(params.port, 502);
        assert_eq!(params.unit_id, 1);
        assert_eq!(params.response_timeout(), Duration::from_millis(1000));
        assert_eq!(params.silence_limit(), Duration::from_millis(3000));
        assert_eq!(params.error_recovery, ErrorRecoveryMode::LinkAndProtocol);
        assert_eq!(params.endpoint(), "127.0.0.1:502");
    }

    #[test]
    fn register_counts_per_type() {
        assert_eq!(DataType::Int16.register_count(8), 1);
        assert_eq!(DataType::Float32.register_count(8), 2);
        assert_eq!(DataType::Float64.register_count(8), 4);
        assert_eq!(DataType::String.register_count(5), 5);
    }

    #[test]
    fn validation_rejects_broken_invariants() {
        let base = RegisterConfig::new(100, DataType::Int16, RegisterKind::HoldingRegister);
        assert!(base.validate().is_ok());

        assert!(matches!(
            base.clone().with_scale(0.0).validate(),
            Err(ConfigError::ZeroScale)
        ));
        assert!(matches!(
            base.clone().with_range(10.0, 10.0).validate(),
            Err(ConfigError::EmptyRange { .. })
        ));
        assert!(matches!(
            base.clone().with_range(0.0, 100.0).with_alarm(50.0, 20.0).validate(),
            Err(ConfigError::AlarmLimits { .. })
        ));
        assert!(matches!(
            base.clone().with_range(0.0, 100.0).with_alarm(10.0, 200.0).validate(),
            Err(ConfigError::AlarmLimits { .. })
        ));
        assert!(base
            .clone()
            .with_range(0.0, 100.0)
            .with_alarm(0.0, 100.0)
            .validate()
            .is_ok());
    }

    #[test]
    fn bit_tables_only_hold_bits() {
        let config = RegisterConfig::new(1, DataType::Word, RegisterKind::Coil);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::KindMismatch { .. })
        ));
        assert!(RegisterConfig::new(1, DataType::Bit, RegisterKind::DiscreteInput)
            .validate()
            .is_ok());
    }

    #[test]
    fn multi_word_register_must_fit_the_address_space() {
        let config = RegisterConfig::new(0xFFFF, DataType::Float32, RegisterKind::HoldingRegister);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn byte_order_parses_common_spellings() {
        assert_eq!("AB CD".parse::<ByteOrder>().ok(), Some(ByteOrder::AbCd));
        assert_eq!("cd_ab".parse::<ByteOrder>().ok(), Some(ByteOrder::CdAb));
        assert_eq!("BADC".parse::<ByteOrder>().ok(), Some(ByteOrder::BaDc));
        assert!("XY".parse::<ByteOrder>().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: RegisterConfig =
            serde_json::from_str(r#"{"address": 7, "data_type": "Float32", "byte_order": "CD_AB"}"#)
                .unwrap();
        assert_eq!(config.address, 7);
        assert_eq!(config.kind, RegisterKind::HoldingRegister);
        assert_eq!(config.byte_order, ByteOrder::CdAb);
        assert_eq!(config.scale_factor, 1.0);
    }
}
