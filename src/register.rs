//! One PLC register: typed value, scaling, range checks and alarm tracking.

pub mod codec;
mod value;

pub use value::Value;

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::RegisterError;
use crate::types::{DataType, RegisterConfig, RegisterKind};

const EVENT_CAPACITY: usize = 256;

/// Notifications emitted by a [`RegisterModel`], in the order the state
/// changes happened.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterEvent {
    ValueChanged { address: u16, value: Option<Value> },
    ScaledValueChanged { address: u16, value: Option<Value> },
    AlarmStateChanged { address: u16, in_alarm: bool },
    ConfigChanged { address: u16 },
    StatisticsReset { address: u16 },
    Error { address: u16, message: String },
}

impl RegisterEvent {
    pub fn address(&self) -> u16 {
        match self {
            Self::ValueChanged { address, .. }
            | Self::ScaledValueChanged { address, .. }
            | Self::AlarmStateChanged { address, .. }
            | Self::ConfigChanged { address }
            | Self::StatisticsReset { address }
            | Self::Error { address, .. } => *address,
        }
    }
}

#[derive(Debug)]
struct RegisterState {
    config: RegisterConfig,
    value: Option<Value>,
    in_alarm: bool,
    last_update: Option<DateTime<Utc>>,
    update_count: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct RegisterModel {
    address: u16,
    data_type: DataType,
    kind: RegisterKind,
    state: Mutex<RegisterState>,
    events: broadcast::Sender<RegisterEvent>,
}

impl RegisterModel {
    pub fn new(config: RegisterConfig) -> Result<Self, RegisterError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(config, events)
    }

    /// Creates a register that publishes on a shared event channel.
    pub fn with_events(
        config: RegisterConfig,
        events: broadcast::Sender<RegisterEvent>,
    ) -> Result<Self, RegisterError> {
        config.validate()?;
        Ok(Self {
            address: config.address,
            data_type: config.data_type,
            kind: config.kind,
            state: Mutex::new(RegisterState {
                config,
                value: None,
                in_alarm: false,
                last_update: None,
                update_count: 0,
                last_error: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegisterEvent> {
        self.events.subscribe()
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn config(&self) -> RegisterConfig {
        self.lock().config.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.lock().config.read_only
    }

    /// Raw stored value, `None` while invalid.
    pub fn value(&self) -> Option<Value> {
        self.lock().value.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.lock().value.is_some()
    }

    pub fn in_alarm(&self) -> bool {
        self.lock().in_alarm
    }

    /// Engineering value: `raw * scale` as `Float64` for numeric types, the raw
    /// value otherwise.
    pub fn scaled_value(&self) -> Option<Value> {
        let state = self.lock();
        scaled(&state.config, state.value.as_ref())
    }

    pub fn formatted_value(&self) -> String {
        let state = self.lock();
        format_value(&state.config, state.value.as_ref())
    }

    /// Stored value serialized back into wire bytes.
    pub fn raw_data(&self) -> Option<Vec<u8>> {
        let state = self.lock();
        state.value.as_ref().map(|v| {
            codec::encode(v, state.config.byte_order, state.config.string_length)
        })
    }

    pub fn update_count(&self) -> u64 {
        self.lock().update_count
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_update
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Validates an engineering value and converts it to storage form without
    /// touching the register.
    pub fn prepare(&self, candidate: impl Into<Value>) -> Result<Value, RegisterError> {
        let candidate = candidate.into();
        let mut state = self.lock();
        let result = if state.config.read_only {
            Err(RegisterError::ReadOnly {
                address: self.address,
            })
        } else {
            to_storage(&state.config, &candidate)
        };
        if let Err(e) = &result {
            self.report(&mut state, e);
        }
        result
    }

    /// Writes an engineering value. Returns whether the stored value changed.
    pub fn set_value(&self, candidate: impl Into<Value>) -> Result<bool, RegisterError> {
        let candidate = candidate.into();
        let mut state = self.lock();
        if state.config.read_only {
            let err = RegisterError::ReadOnly {
                address: self.address,
            };
            self.report(&mut state, &err);
            return Err(err);
        }
        match to_storage(&state.config, &candidate) {
            Ok(value) => Ok(self.store(&mut state, value)),
            Err(e) => {
                self.report(&mut state, &e);
                Err(e)
            }
        }
    }

    pub fn set_scaled_value(&self, candidate: impl Into<Value>) -> Result<bool, RegisterError> {
        self.set_value(candidate)
    }

    /// Stores a value received from the wire. Read-only registers accept it.
    pub fn set_raw_data(&self, bytes: &[u8]) -> Result<bool, RegisterError> {
        let mut state = self.lock();
        let decoded = codec::decode(bytes, self.data_type, state.config.byte_order)
            .map_err(|reason| RegisterError::Conversion {
                address: self.address,
                reason,
            })
            .and_then(|value| {
                check_range(&state.config, &value)?;
                Ok(value)
            });
        match decoded {
            Ok(value) => Ok(self.store(&mut state, value)),
            Err(e) => {
                self.report(&mut state, &e);
                Err(e)
            }
        }
    }

    /// Replaces the configuration, keeping address, data type and kind.
    pub fn update_config(&self, config: RegisterConfig) -> Result<(), RegisterError> {
        let mut state = self.lock();
        self.apply_config(&mut state, config)
    }

    pub fn set_scale_factor(&self, scale_factor: f64) -> Result<(), RegisterError> {
        self.modify(|c| c.scale_factor = scale_factor)
    }

    pub fn set_unit(&self, unit: impl Into<String>) -> Result<(), RegisterError> {
        let unit = unit.into();
        self.modify(|c| c.unit = unit)
    }

    pub fn set_range(&self, min_value: f64, max_value: f64) -> Result<(), RegisterError> {
        self.modify(|c| {
            c.min_value = min_value;
            c.max_value = max_value;
        })
    }

    pub fn set_alarm_enabled(&self, enabled: bool) -> Result<(), RegisterError> {
        self.modify(|c| c.alarm_enabled = enabled)
    }

    pub fn set_alarm_limits(&self, low: f64, high: f64) -> Result<(), RegisterError> {
        self.modify(|c| {
            c.alarm_low = low;
            c.alarm_high = high;
        })
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<(), RegisterError> {
        self.modify(|c| c.read_only = read_only)
    }

    pub fn invalidate(&self) {
        let mut state = self.lock();
        self.clear_value(&mut state);
        self.check_alarm(&mut state);
    }

    pub fn reset_statistics(&self) {
        let mut state = self.lock();
        state.update_count = 0;
        state.last_update = None;
        self.emit(RegisterEvent::StatisticsReset {
            address: self.address,
        });
    }

    fn modify(&self, edit: impl FnOnce(&mut RegisterConfig)) -> Result<(), RegisterError> {
        let mut state = self.lock();
        let mut config = state.config.clone();
        edit(&mut config);
        if config == state.config {
            return Ok(());
        }
        self.apply_config(&mut state, config)
    }

    fn apply_config(
        &self,
        state: &mut RegisterState,
        mut config: RegisterConfig,
    ) -> Result<(), RegisterError> {
        config.address = self.address;
        config.data_type = self.data_type;
        config.kind = self.kind;
        if let Err(e) = config.validate() {
            let err = RegisterError::from(e);
            self.report(state, &err);
            return Err(err);
        }

        let scale_changed = config.scale_factor != state.config.scale_factor;
        state.config = config;

        let still_valid = state
            .value
            .as_ref()
            .map(|v| check_range(&state.config, v).is_ok());
        match still_valid {
            Some(false) => {
                debug!(address = self.address, "stored value invalid under new configuration");
                self.clear_value(state);
            }
            Some(true) if scale_changed => self.emit(RegisterEvent::ScaledValueChanged {
                address: self.address,
                value: scaled(&state.config, state.value.as_ref()),
            }),
            _ => {}
        }

        self.check_alarm(state);
        self.emit(RegisterEvent::ConfigChanged {
            address: self.address,
        });
        Ok(())
    }

    fn store(&self, state: &mut RegisterState, value: Value) -> bool {
        if state.value.as_ref() == Some(&value) {
            return false;
        }
        state.value = Some(value);
        state.last_update = Some(Utc::now());
        state.update_count += 1;
        self.check_alarm(state);
        self.emit(RegisterEvent::ValueChanged {
            address: self.address,
            value: state.value.clone(),
        });
        self.emit(RegisterEvent::ScaledValueChanged {
            address: self.address,
            value: scaled(&state.config, state.value.as_ref()),
        });
        true
    }

    fn clear_value(&self, state: &mut RegisterState) {
        state.value = None;
        state.last_update = Some(Utc::now());
        self.emit(RegisterEvent::ValueChanged {
            address: self.address,
            value: None,
        });
        self.emit(RegisterEvent::ScaledValueChanged {
            address: self.address,
            value: None,
        });
    }

    fn check_alarm(&self, state: &mut RegisterState) {
        let in_alarm = match (&state.value, state.config.alarm_enabled) {
            (Some(value), true) => engineering(&state.config, value)
                .map(|v| v < state.config.alarm_low || v > state.config.alarm_high)
                .unwrap_or(false),
            _ => false,
        };
        if in_alarm != state.in_alarm {
            state.in_alarm = in_alarm;
            self.emit(RegisterEvent::AlarmStateChanged {
                address: self.address,
                in_alarm,
            });
        }
    }

    fn report(&self, state: &mut RegisterState, err: &RegisterError) {
        warn!(address = self.address, error = %err, "register update rejected");
        state.last_error = Some(err.to_string());
        self.emit(RegisterEvent::Error {
            address: self.address,
            message: err.to_string(),
        });
    }

    fn emit(&self, event: RegisterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn engineering(config: &RegisterConfig, value: &Value) -> Option<f64> {
    if !config.data_type.is_numeric() {
        return None;
    }
    value.as_f64().map(|raw| raw * config.scale_factor)
}

fn scaled(config: &RegisterConfig, value: Option<&Value>) -> Option<Value> {
    let value = value?;
    match engineering(config, value) {
        Some(v) => Some(Value::Float64(v)),
        None => Some(value.clone()),
    }
}

fn check_range(config: &RegisterConfig, value: &Value) -> Result<(), RegisterError> {
    match engineering(config, value) {
        Some(v) if !(config.min_value..=config.max_value).contains(&v) => {
            Err(RegisterError::OutOfRange {
                address: config.address,
                value: v,
                min: config.min_value,
                max: config.max_value,
            })
        }
        _ => Ok(()),
    }
}

/// Engineering value to storage representation: range check, inverse scaling,
/// rounding for integer types.
fn to_storage(config: &RegisterConfig, candidate: &Value) -> Result<Value, RegisterError> {
    let address = config.address;
    let data_type = config.data_type;
    let conversion = |reason: String| RegisterError::Conversion { address, reason };

    match data_type {
        DataType::Bit => candidate
            .as_bool()
            .map(Value::Bit)
            .ok_or_else(|| conversion(format!("'{candidate}' is not a bit value"))),
        DataType::String | DataType::WString => {
            let text = candidate.to_string();
            if data_type == DataType::String {
                if let Some(c) = text.chars().find(|c| u32::from(*c) > 0xFF) {
                    return Err(conversion(format!("'{c}' does not fit in one byte")));
                }
            }
            let capacity = usize::from(config.string_length);
            let used = if data_type == DataType::String {
                text.chars().count().div_ceil(2)
            } else {
                text.encode_utf16().count()
            };
            if used > capacity {
                return Err(conversion(format!(
                    "text needs {used} registers, {capacity} configured"
                )));
            }
            Ok(if data_type == DataType::String {
                Value::String(text)
            } else {
                Value::WString(text)
            })
        }
        _ => {
            let x = candidate
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| conversion(format!("'{candidate}' is not a number")))?;
            if !(config.min_value..=config.max_value).contains(&x) {
                return Err(RegisterError::OutOfRange {
                    address,
                    value: x,
                    min: config.min_value,
                    max: config.max_value,
                });
            }
            let mut raw = x / config.scale_factor;
            if data_type.is_integer() {
                raw = raw.round();
            }
            let (lo, hi) = data_type.bounds().unwrap_or((f64::MIN, f64::MAX));
            if !(lo..=hi).contains(&raw) {
                return Err(RegisterError::Unrepresentable {
                    value: raw,
                    data_type,
                });
            }
            Ok(match data_type {
                DataType::Byte => Value::Byte(raw as u8),
                DataType::Word => Value::Word(raw as u16),
                DataType::Int16 => Value::Int16(raw as i16),
                DataType::DWord => Value::DWord(raw as u32),
                DataType::DInt32 => Value::DInt32(raw as i32),
                DataType::Float32 => Value::Float32(raw as f32),
                _ => Value::Float64(raw),
            })
        }
    }
}

fn format_value(config: &RegisterConfig, value: Option<&Value>) -> String {
    let Some(value) = value else {
        return "---".to_string();
    };
    let mut text = match value {
        Value::Bit(b) => u8::from(*b).to_string(),
        Value::Byte(v) => format!("0x{v:02X}"),
        Value::Word(v) => format!("0x{v:04X}"),
        Value::DWord(v) => format!("0x{v:08X}"),
        Value::Int16(v) => v.to_string(),
        Value::DInt32(v) => v.to_string(),
        Value::Float32(v) => format!("{v:.3}"),
        Value::Float64(v) => format!("{v:.6}"),
        Value::String(s) | Value::WString(s) => s.clone(),
    };
    if config.scale_factor != 1.0 {
        if let Some(v) = engineering(config, value) {
            text = format!("{v:.3}");
        }
    }
    if !config.unit.is_empty() {
        text.push(' ');
        text.push_str(&config.unit);
    }
    text
}
