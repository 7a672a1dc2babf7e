//! Serializable snapshot of a device: identity, timing, connection and
//! register configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::error::DeviceError;
use crate::types::{ConnectionParams, RegisterConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDocument {
    pub device_name: String,
    pub polling_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    pub connection_params: ConnectionParams,
    pub registers: Vec<RegisterConfig>,
}

/// Registers are kept raw so one bad entry does not reject the document.
#[derive(Deserialize)]
#[serde(default)]
struct RawDocument {
    device_name: String,
    polling_interval_ms: u64,
    watchdog_interval_ms: u64,
    connection_params: ConnectionParams,
    registers: Vec<Json>,
}

impl Default for RawDocument {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            polling_interval_ms: super::DEFAULT_POLLING_INTERVAL.as_millis() as u64,
            watchdog_interval_ms: super::DEFAULT_WATCHDOG_INTERVAL.as_millis() as u64,
            connection_params: ConnectionParams::default(),
            registers: Vec::new(),
        }
    }
}

impl DeviceDocument {
    pub fn to_json(&self) -> Result<String, DeviceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a document. Register entries that do not deserialize are
    /// skipped with a warning; entries without a byte order inherit the
    /// connection default.
    pub fn from_json(text: &str) -> Result<Self, DeviceError> {
        let raw: RawDocument = serde_json::from_str(text)?;
        let default_order = raw.connection_params.byte_order;

        let registers = raw
            .registers
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let explicit_order = entry.get("byte_order").is_some();
                match serde_json::from_value::<RegisterConfig>(entry) {
                    Ok(mut config) => {
                        if !explicit_order {
                            config.byte_order = default_order;
                        }
                        Some(config)
                    }
                    Err(e) => {
                        warn!(index, error = %e, "skipping malformed register entry");
                        None
                    }
                }
            })
            .collect();

        Ok(Self {
            device_name: raw.device_name,
            polling_interval_ms: raw.polling_interval_ms,
            watchdog_interval_ms: raw.watchdog_interval_ms,
            connection_params: raw.connection_params,
            registers,
        })
    }
}
