//! A polled device: one [`DeviceConnection`] plus the registers read from it.
//!
//! Each poll tick snapshots the register set, coalesces it into read runs
//! and distributes the returned words or bits back to the registers. A
//! device watchdog reconnects when no run has been read for a whole
//! watchdog interval.

pub mod document;
pub mod poll;

pub use document::DeviceDocument;
pub use poll::{coalesce, ReadRun};

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{DeviceConnection, Request, Response, Statistics};
use crate::error::{ConnError, DeviceError, RegisterError};
use crate::register::{codec, RegisterEvent, RegisterModel, Value};
use crate::types::{ConnectionParams, RegisterConfig};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(5000);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    RegisterAdded(u16),
    RegisterRemoved(u16),
    RegisterUpdated(u16),
    RegisterValueChanged { address: u16, value: Option<Value> },
    ConfigurationChanged,
    PollingStarted,
    PollingStopped,
    StatisticsUpdated(Statistics),
}

#[derive(Debug)]
struct PollingTasks {
    poller: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl PollingTasks {
    fn abort(self) {
        self.poller.abort();
        self.watchdog.abort();
    }
}

#[derive(Debug)]
struct DeviceState {
    name: String,
    params: ConnectionParams,
    polling_interval: Duration,
    watchdog_interval: Duration,
    registers: BTreeMap<u16, Arc<RegisterModel>>,
    polling: Option<PollingTasks>,
    last_update: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct DeviceInner {
    connection: DeviceConnection,
    state: Mutex<DeviceState>,
    register_events: broadcast::Sender<RegisterEvent>,
    events: broadcast::Sender<DeviceEvent>,
}

#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(name: impl Into<String>, params: ConnectionParams) -> Self {
        Self::with_connection(name, params, DeviceConnection::new())
    }

    pub fn with_connection(
        name: impl Into<String>,
        params: ConnectionParams,
        connection: DeviceConnection,
    ) -> Self {
        let (register_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let polling_interval = if params.scan_rate_ms > 0 {
            params.scan_rate()
        } else {
            DEFAULT_POLLING_INTERVAL
        };
        Self {
            inner: Arc::new(DeviceInner {
                connection,
                state: Mutex::new(DeviceState {
                    name: name.into(),
                    params,
                    polling_interval,
                    watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
                    registers: BTreeMap::new(),
                    polling: None,
                    last_update: None,
                    last_error: None,
                }),
                register_events,
                events,
            }),
        }
    }

    pub fn from_document(document: &DeviceDocument) -> Self {
        let device = Self::new(
            document.device_name.clone(),
            document.connection_params.clone(),
        );
        device.apply_document(document);
        device
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Events of every register owned by this device.
    pub fn subscribe_registers(&self) -> broadcast::Receiver<RegisterEvent> {
        self.inner.register_events.subscribe()
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.inner.connection
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state().name = name.into();
    }

    pub async fn connect(&self) -> Result<(), DeviceError> {
        let params = self.connection_params();
        self.inner
            .connection
            .connect(params)
            .await
            .map_err(|e| self.fail(e.into()))
    }

    pub async fn disconnect(&self) {
        self.stop_polling();
        self.inner.connection.disconnect().await;
    }

    /// Reopens the session with the current parameters. Polling keeps
    /// running across the reconnect.
    pub async fn reconnect(&self) -> Result<(), DeviceError> {
        info!(device = %self.name(), "reconnecting");
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_params(&self) -> ConnectionParams {
        self.state().params.clone()
    }

    /// Replaces the connection parameters, reconnecting when a session is
    /// active.
    pub async fn set_connection_params(
        &self,
        params: ConnectionParams,
    ) -> Result<(), DeviceError> {
        let changed = {
            let mut state = self.state();
            let changed = state.params != params;
            state.params = params;
            changed
        };
        if !changed {
            return Ok(());
        }
        self.emit(DeviceEvent::ConfigurationChanged);
        if self.is_connected() {
            self.reconnect().await?;
        }
        Ok(())
    }

    pub fn retry_count(&self) -> u32 {
        self.state().params.retry_count
    }

    pub async fn set_retry_count(&self, retry_count: u32) -> Result<(), DeviceError> {
        let mut params = self.connection_params();
        params.retry_count = retry_count;
        self.set_connection_params(params).await
    }

    pub fn polling_interval(&self) -> Duration {
        self.state().polling_interval
    }

    pub fn set_polling_interval(&self, interval: Duration) {
        if interval.is_zero() || interval == self.polling_interval() {
            return;
        }
        self.state().polling_interval = interval;
        self.restart_polling_if_active();
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.state().watchdog_interval
    }

    pub fn set_watchdog_interval(&self, interval: Duration) {
        if interval.is_zero() || interval == self.watchdog_interval() {
            return;
        }
        self.state().watchdog_interval = interval;
        self.restart_polling_if_active();
    }

    pub fn add_register(&self, config: RegisterConfig) -> Result<(), DeviceError> {
        let address = config.address;
        let result = config
            .validate()
            .map_err(|source| DeviceError::Config { address, source })
            .and_then(|()| {
                let mut state = self.state();
                if state.registers.contains_key(&address) {
                    return Err(DeviceError::DuplicateRegister(address));
                }
                let model = RegisterModel::with_events(config, self.inner.register_events.clone())?;
                state.registers.insert(address, Arc::new(model));
                Ok(())
            });
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        debug!(address, "register added");
        self.emit(DeviceEvent::RegisterAdded(address));
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    pub fn remove_register(&self, address: u16) -> Result<(), DeviceError> {
        let removed = self.state().registers.remove(&address);
        if removed.is_none() {
            return Err(self.fail(DeviceError::MissingRegister(address)));
        }
        debug!(address, "register removed");
        self.emit(DeviceEvent::RegisterRemoved(address));
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    /// Replaces a register's configuration. The address is kept; a change of
    /// data type or kind recreates the register with no value.
    pub fn update_register(
        &self,
        address: u16,
        mut config: RegisterConfig,
    ) -> Result<(), DeviceError> {
        config.address = address;
        let result = config
            .validate()
            .map_err(|source| DeviceError::Config { address, source })
            .and_then(|()| self.register(address).ok_or(DeviceError::MissingRegister(address)))
            .and_then(|existing| {
                if existing.data_type() == config.data_type && existing.kind() == config.kind {
                    return Ok(existing.update_config(config)?);
                }
                debug!(
                    address,
                    data_type = %config.data_type,
                    kind = %config.kind,
                    "recreating register"
                );
                let model = RegisterModel::with_events(config, self.inner.register_events.clone())?;
                self.state().registers.insert(address, Arc::new(model));
                Ok(())
            });
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.emit(DeviceEvent::RegisterUpdated(address));
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    pub fn register(&self, address: u16) -> Option<Arc<RegisterModel>> {
        self.state().registers.get(&address).cloned()
    }

    pub fn register_config(&self, address: u16) -> Option<RegisterConfig> {
        self.register(address).map(|r| r.config())
    }

    pub fn register_addresses(&self) -> Vec<u16> {
        self.state().registers.keys().copied().collect()
    }

    pub fn register_value(&self, address: u16) -> Option<Value> {
        self.register(address).and_then(|r| r.value())
    }

    pub fn scaled_value(&self, address: u16) -> Option<Value> {
        self.register(address).and_then(|r| r.scaled_value())
    }

    /// Sets a register's value locally without touching the wire.
    pub fn set_register_value(
        &self,
        address: u16,
        value: impl Into<Value>,
    ) -> Result<bool, DeviceError> {
        let register = self
            .register(address)
            .ok_or(DeviceError::MissingRegister(address))
            .map_err(|e| self.fail(e))?;
        register.set_value(value).map_err(|e| self.fail(e.into()))
    }

    /// Validates `value` against the register, writes it to the device and
    /// stores it once the device confirms. A failed write leaves the stored
    /// value untouched and is not retried.
    pub async fn write_register(
        &self,
        address: u16,
        value: impl Into<Value>,
    ) -> Result<(), DeviceError> {
        let register = self
            .register(address)
            .ok_or(DeviceError::MissingRegister(address))
            .map_err(|e| self.fail(e))?;
        if !register.kind().is_writable() {
            return Err(self.fail(RegisterError::ReadOnly { address }.into()));
        }
        let stored = register.prepare(value).map_err(|e| self.fail(e.into()))?;

        let config = register.config();
        let bytes = codec::encode(&stored, config.byte_order, config.string_length);
        let request = if register.kind().is_bit() {
            Request::write_bits(address, vec![stored.as_bool().unwrap_or(false)])
        } else {
            Request::write_words(address, codec::bytes_to_registers(&bytes))
        };

        self.inner
            .connection
            .execute(request)
            .await
            .map_err(|e| self.fail(e.into()))?;
        register.set_raw_data(&bytes).map_err(|e| self.fail(e.into()))?;
        self.emit(DeviceEvent::RegisterValueChanged {
            address,
            value: Some(stored),
        });
        Ok(())
    }

    /// Runs one poll tick. Returns the number of runs read successfully.
    pub async fn poll_once(&self) -> Result<usize, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Connection(ConnError::NotConnected));
        }
        let registers: Vec<Arc<RegisterModel>> =
            self.state().registers.values().cloned().collect();
        if registers.is_empty() {
            return Ok(0);
        }
        let configs: Vec<RegisterConfig> = registers.iter().map(|r| r.config()).collect();
        let runs = coalesce(&configs);
        debug!(registers = configs.len(), runs = runs.len(), "polling");

        let reads = runs.iter().map(|run| {
            self.inner
                .connection
                .execute(Request::read(run.kind, run.address, run.quantity))
        });
        let responses = join_all(reads).await;

        let by_address: BTreeMap<u16, &Arc<RegisterModel>> =
            registers.iter().map(|r| (r.address(), r)).collect();
        let mut read = 0;
        for (run, response) in runs.iter().zip(responses) {
            match response {
                Ok(response) => {
                    read += 1;
                    self.state().last_update = Some(Instant::now());
                    self.distribute(run, &response, &by_address);
                }
                Err(e) => {
                    warn!(
                        kind = %run.kind,
                        address = run.address,
                        quantity = run.quantity,
                        error = %e,
                        "poll read failed"
                    );
                    self.fail(e.into());
                }
            }
        }
        self.emit(DeviceEvent::StatisticsUpdated(self.statistics()));
        Ok(read)
    }

    fn distribute(
        &self,
        run: &ReadRun,
        response: &Response,
        registers: &BTreeMap<u16, &Arc<RegisterModel>>,
    ) {
        let bytes = match response {
            Response::Words(words) => codec::registers_to_bytes(words),
            _ => Vec::new(),
        };
        for address in &run.registers {
            let Some(register) = registers.get(address) else {
                continue;
            };
            let offset = run.offset_of(*address);
            let outcome = match response {
                Response::Bits(bits) => match bits.get(offset) {
                    Some(bit) => register.set_raw_data(&[0, u8::from(*bit)]),
                    None => continue,
                },
                Response::Words(_) => {
                    let start = offset * 2;
                    let end = start + usize::from(register.config().quantity()) * 2;
                    match bytes.get(start..end) {
                        Some(slice) => register.set_raw_data(slice),
                        None => continue,
                    }
                }
                Response::Written => continue,
            };
            match outcome {
                Ok(true) => self.emit(DeviceEvent::RegisterValueChanged {
                    address: *address,
                    value: register.value(),
                }),
                Ok(false) => {}
                Err(e) => debug!(address = *address, error = %e, "polled value rejected"),
            }
        }
    }

    /// Starts the poll and device watchdog loops. Requires a live session.
    pub fn start_polling(&self) -> Result<(), DeviceError> {
        if self.is_polling() {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(self.fail(ConnError::NotConnected.into()));
        }
        let (polling_interval, watchdog_interval) = {
            let state = self.state();
            (state.polling_interval, state.watchdog_interval)
        };
        let tasks = PollingTasks {
            poller: spawn_poller(Arc::downgrade(&self.inner), polling_interval),
            watchdog: spawn_watchdog(Arc::downgrade(&self.inner), watchdog_interval),
        };
        {
            let mut state = self.state();
            state.last_update = Some(Instant::now());
            state.polling = Some(tasks);
        }
        info!(
            device = %self.name(),
            interval_ms = polling_interval.as_millis() as u64,
            "polling started"
        );
        self.emit(DeviceEvent::PollingStarted);
        Ok(())
    }

    pub fn stop_polling(&self) {
        let tasks = self.state().polling.take();
        if let Some(tasks) = tasks {
            tasks.abort();
            info!(device = %self.name(), "polling stopped");
            self.emit(DeviceEvent::PollingStopped);
        }
    }

    pub fn is_polling(&self) -> bool {
        self.state().polling.is_some()
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.connection.statistics()
    }

    pub fn reset_statistics(&self) {
        self.inner.connection.reset_statistics();
        self.emit(DeviceEvent::StatisticsUpdated(Statistics::default()));
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state().last_error = None;
    }

    pub fn last_communication_time(&self) -> Option<Instant> {
        self.inner.connection.last_communication_time()
    }

    pub fn export_document(&self) -> DeviceDocument {
        let (device_name, polling_interval, watchdog_interval, connection_params, registers) = {
            let state = self.state();
            (
                state.name.clone(),
                state.polling_interval,
                state.watchdog_interval,
                state.params.clone(),
                state.registers.values().cloned().collect::<Vec<_>>(),
            )
        };
        DeviceDocument {
            device_name,
            polling_interval_ms: polling_interval.as_millis() as u64,
            watchdog_interval_ms: watchdog_interval.as_millis() as u64,
            connection_params,
            registers: registers.iter().map(|r| r.config()).collect(),
        }
    }

    /// Replaces name, timing, connection parameters and registers with the
    /// document's. Invalid or duplicate register entries are skipped. An
    /// active session is reopened with the new parameters and polling is
    /// resumed. Returns the number of registers imported.
    pub async fn import_document(&self, document: &DeviceDocument) -> Result<usize, DeviceError> {
        let was_polling = self.is_polling();
        self.stop_polling();
        let imported = self.apply_document(document);
        if self.is_connected() {
            self.reconnect().await?;
            if was_polling {
                self.start_polling()?;
            }
        }
        Ok(imported)
    }

    fn apply_document(&self, document: &DeviceDocument) -> usize {
        let removed: Vec<u16> = {
            let mut state = self.state();
            state.name = document.device_name.clone();
            state.params = document.connection_params.clone();
            if document.polling_interval_ms > 0 {
                state.polling_interval = Duration::from_millis(document.polling_interval_ms);
            }
            if document.watchdog_interval_ms > 0 {
                state.watchdog_interval = Duration::from_millis(document.watchdog_interval_ms);
            }
            std::mem::take(&mut state.registers).into_keys().collect()
        };
        for address in removed {
            self.emit(DeviceEvent::RegisterRemoved(address));
        }

        let mut imported = 0;
        for config in &document.registers {
            match self.add_register(config.clone()) {
                Ok(()) => imported += 1,
                Err(e) => warn!(address = config.address, error = %e, "skipping register entry"),
            }
        }
        info!(
            device = %document.device_name,
            imported,
            skipped = document.registers.len() - imported,
            "configuration loaded"
        );
        self.emit(DeviceEvent::ConfigurationChanged);
        imported
    }

    fn restart_polling_if_active(&self) {
        if self.is_polling() {
            self.stop_polling();
            if let Err(e) = self.start_polling() {
                warn!(error = %e, "could not restart polling");
            }
        }
    }

    /// One device watchdog check.
    async fn watchdog_check(&self) {
        let (stale, limit) = {
            let state = self.state();
            let limit = state.watchdog_interval;
            let stale = !state.registers.is_empty()
                && state.last_update.map_or(true, |t| t.elapsed() > limit);
            (stale, limit)
        };
        if !stale {
            return;
        }
        warn!(
            device = %self.name(),
            limit_ms = limit.as_millis() as u64,
            "no register update within watchdog interval"
        );
        // Failures are already recorded by `fail`.
        if self.reconnect().await.is_ok() {
            self.state().last_update = Some(Instant::now());
        }
    }

    fn fail(&self, error: DeviceError) -> DeviceError {
        self.state().last_error = Some(error.to_string());
        error
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.inner.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_poller(inner: Weak<DeviceInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let device = Device { inner };
            if let Err(e) = device.poll_once().await {
                debug!(error = %e, "poll tick skipped");
            }
        }
    })
}

fn spawn_watchdog(inner: Weak<DeviceInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            Device { inner }.watchdog_check().await;
        }
    })
}
