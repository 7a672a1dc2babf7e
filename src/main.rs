use anyhow::{anyhow, Context, Result};
use plc_poll::{
    ConnectionEvent, ConnectionParams, DataType, Device, DeviceDocument, DeviceEvent,
    RegisterConfig, RegisterEvent, RegisterKind,
};
use std::env;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

enum Event {
    Connection(ConnectionEvent),
    Device(DeviceEvent),
    Register(RegisterEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let device = load_device()?;
    if let Ok(interval) = env::var("POLL_INTERVAL_MS") {
        let interval: u64 = interval.parse().context("POLL_INTERVAL_MS")?;
        device.set_polling_interval(Duration::from_millis(interval));
    }

    let connection_events = BroadcastStream::new(device.connection().subscribe())
        .filter_map(|e| e.ok())
        .map(Event::Connection);
    let device_events = BroadcastStream::new(device.subscribe())
        .filter_map(|e| e.ok())
        .map(Event::Device);
    let register_events = BroadcastStream::new(device.subscribe_registers())
        .filter_map(|e| e.ok())
        .map(Event::Register);
    let events = connection_events.merge(device_events).merge(register_events);
    tokio::pin!(events);

    device.connect().await?;
    device.start_polling()?;
    info!(
        device = %device.name(),
        registers = device.register_addresses().len(),
        "polling"
    );

    loop {
        tokio::select! {
            Some(event) = events.next() => log_event(&device, event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let stats = device.statistics();
    info!(
        total = stats.total_requests,
        ok = stats.successful_requests,
        failed = stats.failed_requests,
        avg_ms = stats.average_response_time_ms,
        "shutting down"
    );
    device.disconnect().await;
    Ok(())
}

/// Builds the device from `PLC_DEVICE_CONFIG` when set, else from
/// `PLC_MODBUS_TCP_ADDRESS`, `PLC_UNIT_ID` and `PLC_REGISTERS`.
fn load_device() -> Result<Device> {
    if let Ok(path) = env::var("PLC_DEVICE_CONFIG") {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let document = DeviceDocument::from_json(&text)?;
        return Ok(Device::from_document(&document));
    }

    let address = env::var("PLC_MODBUS_TCP_ADDRESS").context("PLC_MODBUS_TCP_ADDRESS")?;
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().context("modbus port")?),
        None => (address, 502),
    };
    let unit_id = match env::var("PLC_UNIT_ID") {
        Ok(id) => id.parse().context("PLC_UNIT_ID")?,
        Err(_) => 1,
    };

    let device = Device::new("plc", ConnectionParams::tcp(host, port, unit_id));
    let registers = env::var("PLC_REGISTERS").unwrap_or_else(|_| String::from("0"));
    for address in registers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let address: u16 = address
            .parse()
            .map_err(|_| anyhow!("bad register address '{address}'"))?;
        device.add_register(RegisterConfig::new(
            address,
            DataType::Word,
            RegisterKind::HoldingRegister,
        ))?;
    }
    Ok(device)
}

fn log_event(device: &Device, event: Event) {
    match event {
        Event::Connection(ConnectionEvent::ConnectionError(e)) => error!(error = %e, "connection"),
        Event::Connection(ConnectionEvent::CommunicationError(e)) => {
            warn!(error = %e, "communication")
        }
        Event::Connection(ConnectionEvent::Connected) => info!("connected"),
        Event::Connection(ConnectionEvent::Disconnected) => warn!("disconnected"),
        Event::Connection(_) => {}
        Event::Device(DeviceEvent::RegisterValueChanged { address, .. }) => {
            if let Some(register) = device.register(address) {
                info!(address, value = %register.formatted_value(), "value");
            }
        }
        Event::Device(DeviceEvent::StatisticsUpdated(_)) => {}
        Event::Device(other) => info!(event = ?other, "device"),
        Event::Register(RegisterEvent::AlarmStateChanged { address, in_alarm }) => {
            warn!(address, in_alarm, "alarm")
        }
        Event::Register(RegisterEvent::Error { address, message }) => {
            warn!(address, error = %message, "register")
        }
        Event::Register(_) => {}
    }
}
