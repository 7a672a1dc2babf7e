//! Wire access behind the connection queue.
//!
//! A [`Connector`] opens a [`Transport`] for a [`ConnectionParams`]; the
//! transport executes one [`Request`] at a time. [`ModbusConnector`] builds
//! `tokio-modbus` contexts for every [`TransportKind`].

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Client, Reader, Slave, Writer};
use tokio_modbus::{Error as ModbusError, Exception};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::request::{Request, Response, WritePayload};
use super::udp::UdpStream;
use crate::error::{ConnError, ExceptionKind};
use crate::types::{ConnectionParams, Parity, RegisterKind, TransportKind};

/// An open link to one slave.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    async fn execute(&mut self, request: &Request) -> Result<Response, ConnError>;

    async fn close(&mut self);
}

/// Opens transports. Swapped out in tests.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>, ConnError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>, ConnError> {
        let limit = params.response_timeout();
        let slave = Slave(params.unit_id);
        let endpoint = params.endpoint();
        debug!(kind = %params.kind, %endpoint, unit = params.unit_id, "opening transport");

        let ctx = match params.kind {
            TransportKind::Tcp => tcp::attach_slave(open_tcp(&endpoint, limit).await?, slave),
            TransportKind::RtuOverTcp => {
                rtu::attach_slave(open_tcp(&endpoint, limit).await?, slave)
            }
            TransportKind::Udp => tcp::attach_slave(open_udp(&endpoint, limit).await?, slave),
            TransportKind::RtuOverUdp => {
                rtu::attach_slave(open_udp(&endpoint, limit).await?, slave)
            }
            TransportKind::RtuSerial => rtu::attach_slave(open_serial(params)?, slave),
            TransportKind::AsciiSerial => {
                warn!(port = %endpoint, "ASCII framing unavailable, using RTU framing");
                rtu::attach_slave(open_serial(params)?, slave)
            }
        };

        Ok(Box::new(ModbusTransport {
            ctx,
            timeout: limit,
        }))
    }
}

async fn open_tcp(endpoint: &str, limit: Duration) -> Result<TcpStream, ConnError> {
    let stream = timeout(limit, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ConnError::ConnectionSetup(format!("connecting to {endpoint} timed out")))?
        .map_err(|e| ConnError::ConnectionSetup(format!("{endpoint}: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

async fn open_udp(endpoint: &str, limit: Duration) -> Result<UdpStream, ConnError> {
    timeout(limit, UdpStream::connect(endpoint))
        .await
        .map_err(|_| ConnError::ConnectionSetup(format!("binding {endpoint} timed out")))?
        .map_err(|e| ConnError::ConnectionSetup(format!("{endpoint}: {e}")))
}

fn open_serial(params: &ConnectionParams) -> Result<SerialStream, ConnError> {
    let parity = match params.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let data_bits = match params.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match params.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    tokio_serial::new(&params.serial_port, params.baud_rate)
        .parity(parity)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .timeout(params.response_timeout())
        .open_native_async()
        .map_err(|e| ConnError::ConnectionSetup(format!("{}: {e}", params.serial_port)))
}

/// `tokio-modbus` client context with a per-call response deadline.
#[derive(Debug)]
pub struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
}

async fn settle<T>(
    limit: Duration,
    call: impl Future<Output = tokio_modbus::Result<T>>,
) -> Result<T, ConnError> {
    match timeout(limit, call).await {
        Err(_) => Err(ConnError::Timeout(limit)),
        Ok(Err(e)) => Err(map_wire_error(e)),
        Ok(Ok(Err(code))) => Err(ConnError::Protocol(map_exception(code))),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

fn map_wire_error(error: ModbusError) -> ConnError {
    match error {
        ModbusError::Transport(io_error) => match unsupported_exception(&io_error) {
            Some(kind) => ConnError::Protocol(kind),
            None => ConnError::Transport(io_error.to_string()),
        },
        other => ConnError::Framing(other.to_string()),
    }
}

/// Exception responses with a code the wire library has no variant for (0x07
/// among them) surface as `InvalidData` I/O errors naming the code.
fn unsupported_exception(error: &std::io::Error) -> Option<ExceptionKind> {
    if error.kind() != std::io::ErrorKind::InvalidData {
        return None;
    }
    let message = error.to_string();
    if !message.to_ascii_lowercase().contains("exception") {
        return None;
    }
    let code = message
        .rsplit_once("0x")
        .and_then(|(_, hex)| {
            let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            u8::from_str_radix(&digits, 16).ok()
        })
        .unwrap_or(0);
    Some(ExceptionKind::from_code(code))
}

fn map_exception(code: Exception) -> ExceptionKind {
    match code {
        Exception::IllegalFunction => ExceptionKind::IllegalFunction,
        Exception::IllegalDataAddress => ExceptionKind::IllegalDataAddress,
        Exception::IllegalDataValue => ExceptionKind::IllegalDataValue,
        Exception::ServerDeviceFailure => ExceptionKind::ServerDeviceFailure,
        Exception::Acknowledge => ExceptionKind::Acknowledge,
        Exception::ServerDeviceBusy => ExceptionKind::ServerDeviceBusy,
        Exception::MemoryParityError => ExceptionKind::MemoryParityError,
        Exception::GatewayPathUnavailable => ExceptionKind::GatewayPathUnavailable,
        Exception::GatewayTargetDevice => ExceptionKind::GatewayTargetFailed,
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn execute(&mut self, request: &Request) -> Result<Response, ConnError> {
        let limit = self.timeout;
        let (addr, cnt) = (request.address, request.quantity);
        let ctx = &mut self.ctx;

        match (&request.write, request.kind) {
            (None, RegisterKind::Coil) => {
                settle(limit, ctx.read_coils(addr, cnt)).await.map(Response::Bits)
            }
            (None, RegisterKind::DiscreteInput) => {
                settle(limit, ctx.read_discrete_inputs(addr, cnt))
                    .await
                    .map(Response::Bits)
            }
            (None, RegisterKind::HoldingRegister) => {
                settle(limit, ctx.read_holding_registers(addr, cnt))
                    .await
                    .map(Response::Words)
            }
            (None, RegisterKind::InputRegister) => {
                settle(limit, ctx.read_input_registers(addr, cnt))
                    .await
                    .map(Response::Words)
            }
            (Some(WritePayload::Bits(bits)), _) => {
                let written = match bits.as_slice() {
                    [bit] => settle(limit, ctx.write_single_coil(addr, *bit)).await,
                    _ => settle(limit, ctx.write_multiple_coils(addr, bits)).await,
                };
                written.map(|()| Response::Written)
            }
            (Some(WritePayload::Words(words)), _) => {
                let written = match words.as_slice() {
                    [word] => settle(limit, ctx.write_single_register(addr, *word)).await,
                    _ => settle(limit, ctx.write_multiple_registers(addr, words)).await,
                };
                written.map(|()| Response::Written)
            }
            (Some(WritePayload::Mask { and_mask, or_mask }), _) => {
                settle(limit, ctx.masked_write_register(addr, *and_mask, *or_mask))
                    .await
                    .map(|()| Response::Written)
            }
            (
                Some(WritePayload::ReadWrite {
                    read_address,
                    read_quantity,
                    words,
                }),
                _,
            ) => settle(
                limit,
                ctx.read_write_multiple_registers(*read_address, *read_quantity, addr, words),
            )
            .await
            .map(Response::Words),
        }
    }

    async fn close(&mut self) {
        match timeout(self.timeout, self.ctx.disconnect()).await {
            Ok(Err(e)) => debug!(error = %e, "transport close failed"),
            Err(_) => debug!("transport close timed out"),
            Ok(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn slave_exceptions_keep_their_code() {
        assert_eq!(
            map_exception(Exception::ServerDeviceBusy),
            ExceptionKind::ServerDeviceBusy
        );
        assert_eq!(
            map_exception(Exception::GatewayTargetDevice),
            ExceptionKind::GatewayTargetFailed
        );
    }

    #[test]
    fn unknown_exception_codes_are_protocol_failures() {
        let nak = io::Error::new(io::ErrorKind::InvalidData, "Invalid exception code: 0x07");
        let err = map_wire_error(ModbusError::Transport(nak));
        assert!(matches!(
            err,
            ConnError::Protocol(ExceptionKind::NegativeAcknowledge)
        ));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn io_failures_stay_link_failures() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(map_wire_error(ModbusError::Transport(reset)).is_link_failure());

        let garbled = io::Error::new(io::ErrorKind::InvalidData, "Invalid function code: 0x99");
        assert!(map_wire_error(ModbusError::Transport(garbled)).is_link_failure());
    }
}
