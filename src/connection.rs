//! Device connection: one transport, a FIFO request queue drained on a fixed
//! tick, and a watchdog that reopens the link after prolonged silence.
//!
//! [`DeviceConnection`] is a cheap clonable handle. Requests are validated
//! when queued; their outcome is published as [`ConnectionEvent`]s, or
//! returned through [`DeviceConnection::submit`] when the caller wants it.

#[cfg(test)]
pub(crate) mod mock;
mod request;
mod stats;
pub mod transport;
mod udp;

pub use request::{Request, Response, WritePayload};
pub use stats::Statistics;
pub use transport::{Connector, ModbusConnector, ModbusTransport, Transport};
pub use udp::UdpStream;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_retry::strategy::{jitter, FixedInterval};
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

use crate::error::ConnError;
use crate::types::{ConnectionParams, RegisterKind};
use request::{PendingRequest, Reply};
use stats::StatsRecorder;

pub const QUEUE_INTERVAL: Duration = Duration::from_millis(10);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(5000);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ConnectionError(String),
    CommunicationError(String),
    RequestCompleted { success: bool },
    StatisticsUpdated(Statistics),
}

/// Periods of the queue drain and watchdog loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub queue_interval: Duration,
    pub watchdog_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            queue_interval: QUEUE_INTERVAL,
            watchdog_interval: WATCHDOG_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    params: Option<ConnectionParams>,
    queue: VecDeque<PendingRequest>,
    next_id: u64,
    last_exchange: Option<Instant>,
    last_error: Option<String>,
    drain: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    connector: Arc<dyn Connector>,
    timing: Timing,
    /// Held for the duration of one wire exchange.
    transport: AsyncMutex<Option<Box<dyn Transport>>>,
    /// Serializes connect, disconnect and watchdog reconnects.
    lifecycle: AsyncMutex<()>,
    shared: Mutex<Shared>,
    stats: Mutex<StatsRecorder>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Debug, Clone)]
pub struct DeviceConnection {
    inner: Arc<Inner>,
}

impl Default for DeviceConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConnection {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(ModbusConnector), Timing::default())
    }

    pub fn with_connector(connector: Arc<dyn Connector>, timing: Timing) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                timing,
                transport: AsyncMutex::new(None),
                lifecycle: AsyncMutex::new(()),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    params: None,
                    queue: VecDeque::new(),
                    next_id: 0,
                    last_exchange: None,
                    last_error: None,
                    drain: None,
                    watchdog: None,
                }),
                stats: Mutex::new(StatsRecorder::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Opens a new session, tearing down any existing one first.
    pub async fn connect(&self, params: ConnectionParams) -> Result<(), ConnError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.teardown().await {
            self.inner.emit(ConnectionEvent::Disconnected);
        }

        {
            let mut shared = self.inner.shared();
            shared.state = ConnectionState::Connecting;
            shared.params = Some(params.clone());
        }
        info!(
            kind = %params.kind,
            endpoint = %params.endpoint(),
            unit = params.unit_id,
            "connecting"
        );

        match self.inner.connector.open(&params).await {
            Ok(transport) => {
                *self.inner.transport.lock().await = Some(transport);
                {
                    let mut shared = self.inner.shared();
                    shared.state = ConnectionState::Connected;
                    shared.last_exchange = Some(Instant::now());
                    shared.drain = Some(spawn_drain(
                        Arc::downgrade(&self.inner),
                        self.inner.timing.queue_interval,
                    ));
                    shared.watchdog = Some(spawn_watchdog(
                        Arc::downgrade(&self.inner),
                        self.inner.timing.watchdog_interval,
                    ));
                }
                info!(endpoint = %params.endpoint(), "connected");
                self.inner.emit(ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                {
                    let mut shared = self.inner.shared();
                    shared.state = ConnectionState::Disconnected;
                    shared.last_error = Some(e.to_string());
                }
                error!(endpoint = %params.endpoint(), error = %e, "connection failed");
                self.inner.emit(ConnectionEvent::ConnectionError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops both loops, discards queued requests and closes the transport.
    /// A request already on the wire is allowed to finish first.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.teardown().await {
            info!("disconnected");
            self.inner.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Reconnects with the parameters of the last session.
    pub async fn reconnect(&self) -> Result<(), ConnError> {
        let params = self.params().ok_or(ConnError::NotConnected)?;
        self.connect(params).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn params(&self) -> Option<ConnectionParams> {
        self.inner.shared().params.clone()
    }

    pub fn timing(&self) -> Timing {
        self.inner.timing
    }

    pub fn retry_count(&self) -> u32 {
        self.inner
            .shared()
            .params
            .as_ref()
            .map_or(0, |p| p.retry_count)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.shared().last_error.clone()
    }

    pub fn last_communication_time(&self) -> Option<Instant> {
        self.inner.shared().last_exchange
    }

    pub fn queue_len(&self) -> usize {
        self.inner.shared().queue.len()
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.stats().snapshot()
    }

    pub fn reset_statistics(&self) {
        self.inner.stats().reset();
        self.inner
            .emit(ConnectionEvent::StatisticsUpdated(Statistics::default()));
    }

    /// Queues a request. The outcome is only reported through events.
    pub fn enqueue(&self, request: Request) -> Result<(), ConnError> {
        self.push(request, None)
    }

    /// Queues a request and hands back a receiver for its outcome.
    pub fn submit(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<Result<Response, ConnError>>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.push(request, Some(tx))?;
        Ok(rx)
    }

    /// Queues a request and waits for it to leave the queue.
    pub async fn execute(&self, request: Request) -> Result<Response, ConnError> {
        let rx = self.submit(request)?;
        rx.await.unwrap_or(Err(ConnError::NotConnected))
    }

    pub fn enqueue_read(
        &self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<(), ConnError> {
        self.enqueue(Request::read(kind, address, quantity))
    }

    pub fn enqueue_write(
        &self,
        kind: RegisterKind,
        address: u16,
        payload: WritePayload,
    ) -> Result<(), ConnError> {
        let quantity = match &payload {
            WritePayload::Bits(bits) => bits.len(),
            WritePayload::Words(words) | WritePayload::ReadWrite { words, .. } => words.len(),
            WritePayload::Mask { .. } => 1,
        };
        self.enqueue(Request {
            kind,
            address,
            quantity: u16::try_from(quantity).unwrap_or(u16::MAX),
            write: Some(payload),
        })
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<(), ConnError> {
        self.enqueue_read(RegisterKind::Coil, address, quantity)
    }

    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<(), ConnError> {
        self.enqueue_read(RegisterKind::DiscreteInput, address, quantity)
    }

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<(), ConnError> {
        self.enqueue_read(RegisterKind::HoldingRegister, address, quantity)
    }

    pub fn read_input_registers(&self, address: u16, quantity: u16) -> Result<(), ConnError> {
        self.enqueue_read(RegisterKind::InputRegister, address, quantity)
    }

    pub fn write_coil(&self, address: u16, value: bool) -> Result<(), ConnError> {
        self.enqueue(Request::write_bits(address, vec![value]))
    }

    pub fn write_register(&self, address: u16, value: u16) -> Result<(), ConnError> {
        self.enqueue(Request::write_words(address, vec![value]))
    }

    pub fn write_multiple_coils(&self, address: u16, values: Vec<bool>) -> Result<(), ConnError> {
        self.enqueue(Request::write_bits(address, values))
    }

    pub fn write_multiple_registers(
        &self,
        address: u16,
        values: Vec<u16>,
    ) -> Result<(), ConnError> {
        self.enqueue(Request::write_words(address, values))
    }

    pub fn mask_write_register(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ConnError> {
        self.enqueue(Request::mask_write(address, and_mask, or_mask))
    }

    pub fn read_write_multiple_registers(
        &self,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: Vec<u16>,
    ) -> Result<(), ConnError> {
        self.enqueue(Request::read_write(
            read_address,
            read_quantity,
            write_address,
            values,
        ))
    }

    fn push(&self, request: Request, reply: Option<Reply>) -> Result<(), ConnError> {
        let mut shared = self.inner.shared();
        let checked = request.validate().and_then(|()| match shared.state {
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                let writable = shared.params.as_ref().is_some_and(|p| p.read_write_enabled);
                if request.is_write() && !writable {
                    Err(ConnError::Validation(
                        "writes are disabled for this connection".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Err(ConnError::NotConnected),
        });
        if let Err(e) = checked {
            warn!(%request, error = %e, "request rejected");
            shared.last_error = Some(e.to_string());
            return Err(e);
        }

        let id = shared.next_id;
        shared.next_id += 1;
        debug!(id, %request, depth = shared.queue.len() + 1, "request queued");
        shared.queue.push_back(PendingRequest {
            id,
            request,
            enqueued_at: Instant::now(),
            reply,
        });
        Ok(())
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, StatsRecorder> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Returns whether a session was active.
    async fn teardown(&self) -> bool {
        let (drain, watchdog, was_active, dropped) = {
            let mut shared = self.shared();
            let dropped = shared.queue.len();
            shared.queue.clear();
            let was_active = shared.state != ConnectionState::Disconnected;
            shared.state = ConnectionState::Disconnected;
            (
                shared.drain.take(),
                shared.watchdog.take(),
                was_active,
                dropped,
            )
        };
        if let Some(handle) = watchdog {
            handle.abort();
        }
        let mut slot = self.transport.lock().await;
        if let Some(handle) = drain {
            handle.abort();
        }
        if let Some(mut transport) = slot.take() {
            transport.close().await;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued requests");
        }
        was_active
    }

    async fn reopen(
        &self,
        slot: &mut Option<Box<dyn Transport>>,
        params: &ConnectionParams,
    ) -> Result<(), ConnError> {
        if let Some(mut old) = slot.take() {
            old.close().await;
        }
        let strategy = FixedInterval::from_millis(10).map(jitter).take(3);
        let transport = Retry::spawn(strategy, || self.connector.open(params)).await?;
        *slot = Some(transport);
        Ok(())
    }

    async fn drain_one(&self) {
        let next = self.shared().queue.pop_front();
        let Some(mut pending) = next else {
            return;
        };
        debug!(
            id = pending.id,
            request = %pending.request,
            waited_ms = pending.enqueued_at.elapsed().as_millis() as u64,
            "dispatching"
        );

        let (outcome, latency) = {
            let mut slot = self.transport.lock().await;
            let started = Instant::now();
            let outcome = match slot.as_mut() {
                Some(transport) => transport.execute(&pending.request).await,
                None => Err(ConnError::NotConnected),
            };
            let latency = started.elapsed();
            if let Err(e) = &outcome {
                self.recover(&mut slot, e).await;
            }
            (outcome, latency)
        };

        let success = outcome.is_ok();
        let snapshot = {
            let mut stats = self.stats();
            stats.record(success, latency);
            stats.snapshot()
        };
        match &outcome {
            Ok(_) => {
                self.shared().last_exchange = Some(Instant::now());
                debug!(
                    id = pending.id,
                    elapsed_ms = latency.as_millis() as u64,
                    "request completed"
                );
            }
            Err(e) => {
                let message = format!("{}: {e}", pending.request);
                warn!(id = pending.id, error = %message, "request failed");
                {
                    let mut shared = self.shared();
                    // A slave exception still proves the link is alive.
                    if matches!(e, ConnError::Protocol(_)) {
                        shared.last_exchange = Some(Instant::now());
                    }
                    shared.last_error = Some(message.clone());
                }
                self.emit(ConnectionEvent::CommunicationError(message));
            }
        }
        self.emit(ConnectionEvent::RequestCompleted { success });
        self.emit(ConnectionEvent::StatisticsUpdated(snapshot));

        if let Some(reply) = pending.reply.take() {
            let _ = reply.send(outcome);
        }
    }

    /// Applies the session's error recovery policy after a failed exchange.
    async fn recover(&self, slot: &mut Option<Box<dyn Transport>>, err: &ConnError) {
        let params = {
            let shared = self.shared();
            if shared.state != ConnectionState::Connected {
                return;
            }
            match &shared.params {
                Some(params) => params.clone(),
                None => return,
            }
        };
        let mode = params.error_recovery;
        let wanted = (err.is_link_failure() && mode.recovers_link())
            || (err.is_protocol_failure() && mode.recovers_protocol());
        if !wanted {
            return;
        }

        warn!(error = %err, ?mode, "reopening transport");
        self.shared().state = ConnectionState::Reconnecting;
        match self.reopen(slot, &params).await {
            Ok(()) => {
                self.shared().state = ConnectionState::Connected;
                info!(endpoint = %params.endpoint(), "transport reopened");
            }
            Err(e) => {
                error!(endpoint = %params.endpoint(), error = %e, "could not reopen transport");
                self.give_up(&e);
            }
        }
    }

    /// Ends a session whose transport could not be reopened. Queued requests
    /// are dropped and both loops stop; `reconnect` starts over.
    fn give_up(&self, err: &ConnError) {
        let (drain, watchdog) = {
            let mut shared = self.shared();
            shared.state = ConnectionState::Disconnected;
            shared.last_error = Some(err.to_string());
            shared.queue.clear();
            (shared.drain.take(), shared.watchdog.take())
        };
        for handle in [drain, watchdog].into_iter().flatten() {
            handle.abort();
        }
        self.emit(ConnectionEvent::ConnectionError(err.to_string()));
        self.emit(ConnectionEvent::Disconnected);
    }

    /// One watchdog check. Returns false once the session is given up.
    async fn watchdog_tick(&self) -> bool {
        let (params, silent_for) = {
            let shared = self.shared();
            if shared.state != ConnectionState::Connected {
                return true;
            }
            let Some(params) = shared.params.clone() else {
                return true;
            };
            let silent_for = shared
                .last_exchange
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if silent_for <= params.silence_limit() {
                return true;
            }
            (params, silent_for)
        };
        let Ok(_lifecycle) = self.lifecycle.try_lock() else {
            return true;
        };

        warn!(
            silent_ms = silent_for.as_millis() as u64,
            limit_ms = params.silence_limit().as_millis() as u64,
            "no exchange within silence limit, reconnecting"
        );
        self.shared().state = ConnectionState::Reconnecting;
        let reopened = {
            let mut slot = self.transport.lock().await;
            self.reopen(&mut slot, &params).await
        };

        match reopened {
            Ok(()) => {
                {
                    let mut shared = self.shared();
                    shared.state = ConnectionState::Connected;
                    shared.last_exchange = Some(Instant::now());
                }
                info!(endpoint = %params.endpoint(), "reconnected");
                self.emit(ConnectionEvent::Connected);
                true
            }
            Err(e) => {
                error!(endpoint = %params.endpoint(), error = %e, "reconnect failed, giving up");
                self.give_up(&e);
                false
            }
        }
    }
}

fn spawn_drain(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.drain_one().await;
        }
    })
}

fn spawn_watchdog(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.watchdog_tick().await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;
    use crate::error::ExceptionKind;
    use crate::types::ErrorRecoveryMode;
    use tokio::time::sleep;

    fn setup() -> (DeviceConnection, MockConnector) {
        let mock = MockConnector::default();
        let conn = DeviceConnection::with_connector(Arc::new(mock.clone()), Timing::default());
        (conn, mock)
    }

    fn params() -> ConnectionParams {
        ConnectionParams::tcp("plc.local", 502, 1)
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn connect_enters_connected_and_announces_it() {
        let (conn, mock) = setup();
        let mut rx = conn.subscribe();
        conn.connect(params()).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(mock.opens(), 1);
        assert_eq!(conn.retry_count(), 3);
        assert_eq!(drain(&mut rx), vec![ConnectionEvent::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reports_setup_error() {
        let (conn, mock) = setup();
        mock.state().refuse_open = true;
        let mut rx = conn.subscribe();

        let err = conn.connect(params()).await.unwrap_err();
        assert!(matches!(err, ConnError::ConnectionSetup(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.last_error().unwrap().contains("refused"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ConnectionEvent::ConnectionError(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_run_in_enqueue_order_regardless_of_latency() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        mock.delay_next(Duration::from_millis(50));
        mock.delay_next(Duration::from_millis(1));
        mock.delay_next(Duration::from_millis(20));

        conn.write_register(5, 1).unwrap();
        conn.read_holding_registers(5, 1).unwrap();
        conn.write_register(5, 2).unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(
            mock.calls(),
            vec![
                Request::write_words(5, vec![1]),
                Request::read(RegisterKind::HoldingRegister, 5, 1),
                Request::write_words(5, vec![2]),
            ]
        );
        assert_eq!(
            mock.state().words.get(&(RegisterKind::HoldingRegister, 5)),
            Some(&2)
        );
        assert_eq!(conn.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_returns_the_response() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        mock.set_words(RegisterKind::InputRegister, 30, &[7, 8, 9]);

        let response = conn
            .execute(Request::read(RegisterKind::InputRegister, 30, 3))
            .await
            .unwrap();
        assert_eq!(response, Response::Words(vec![7, 8, 9]));

        mock.set_words(RegisterKind::HoldingRegister, 30, &[7, 8]);
        conn.mask_write_register(31, 0x00FF, 0x0100).unwrap();
        let response = conn
            .execute(Request::read_write(30, 2, 40, vec![5]))
            .await
            .unwrap();
        assert_eq!(response, Response::Words(vec![7, 0x0108]));
        assert_eq!(
            mock.state().words.get(&(RegisterKind::HoldingRegister, 40)),
            Some(&5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_requests_never_reach_the_queue() {
        let (conn, mock) = setup();
        assert!(matches!(
            conn.read_coils(0, 1),
            Err(ConnError::NotConnected)
        ));

        conn.connect(params()).await.unwrap();
        assert!(matches!(
            conn.read_holding_registers(0, 126),
            Err(ConnError::Validation(_))
        ));
        assert!(matches!(
            conn.enqueue_write(RegisterKind::DiscreteInput, 0, WritePayload::Bits(vec![true])),
            Err(ConnError::Validation(_))
        ));
        assert!(matches!(
            conn.read_input_registers(65535, 2),
            Err(ConnError::Validation(_))
        ));
        assert_eq!(conn.queue_len(), 0);
        assert!(conn.last_error().is_some());

        sleep(Duration::from_millis(100)).await;
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_can_be_disabled_per_session() {
        let (conn, _mock) = setup();
        let mut read_only = params();
        read_only.read_write_enabled = false;
        conn.connect(read_only).await.unwrap();

        assert!(matches!(
            conn.write_coil(3, true),
            Err(ConnError::Validation(_))
        ));
        assert!(conn.read_coils(3, 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_surface_as_events_and_statistics() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        let mut rx = conn.subscribe();

        mock.fail_next(ConnError::Protocol(ExceptionKind::IllegalDataAddress));
        mock.delay_next(Duration::from_millis(40));
        let err = conn
            .execute(Request::read(RegisterKind::HoldingRegister, 900, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnError::Protocol(ExceptionKind::IllegalDataAddress)
        ));
        conn.execute(Request::read(RegisterKind::HoldingRegister, 0, 1))
            .await
            .unwrap();

        let stats = conn.statistics();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert!(stats.average_response_time_ms > 19.9);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::CommunicationError(msg) if msg.contains("Illegal data address")
        )));
        assert!(events.contains(&ConnectionEvent::RequestCompleted { success: false }));
        assert!(events.contains(&ConnectionEvent::RequestCompleted { success: true }));
        // Slave exceptions do not reopen the link.
        assert_eq!(mock.opens(), 1);

        conn.reset_statistics();
        assert_eq!(conn.statistics(), Statistics::default());
    }

    #[tokio::test(start_paused = true)]
    async fn link_failures_reopen_the_transport() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();

        mock.fail_next(ConnError::Transport("broken pipe".into()));
        assert!(conn
            .execute(Request::read(RegisterKind::Coil, 0, 8))
            .await
            .is_err());
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.state().closes, 1);
        assert!(conn
            .execute(Request::read(RegisterKind::Coil, 0, 8))
            .await
            .is_ok());
        // The failed request is not replayed.
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_link_recovery_ends_the_session() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        let mut rx = conn.subscribe();

        mock.state().refuse_open = true;
        mock.fail_next(ConnError::Transport("broken pipe".into()));
        assert!(conn
            .execute(Request::read(RegisterKind::Coil, 0, 1))
            .await
            .is_err());

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        let events = drain(&mut rx);
        assert!(events.contains(&ConnectionEvent::Disconnected));
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::ConnectionError(msg) if msg.contains("refused")
        )));
        assert!(matches!(
            conn.read_coils(0, 1),
            Err(ConnError::NotConnected)
        ));

        mock.state().refuse_open = false;
        conn.reconnect().await.unwrap();
        assert!(conn
            .execute(Request::read(RegisterKind::Coil, 0, 1))
            .await
            .is_ok());
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_policy_none_leaves_the_link_alone() {
        let (conn, mock) = setup();
        let mut p = params();
        p.error_recovery = ErrorRecoveryMode::None;
        conn.connect(p).await.unwrap();

        mock.fail_next(ConnError::Timeout(Duration::from_secs(1)));
        mock.fail_next(ConnError::Transport("reset".into()));
        let _ = conn.execute(Request::read(RegisterKind::Coil, 0, 1)).await;
        let _ = conn.execute(Request::read(RegisterKind::Coil, 0, 1)).await;
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reconnects_once_per_silence_breach() {
        let mock = MockConnector::default();
        let timing = Timing {
            queue_interval: QUEUE_INTERVAL,
            watchdog_interval: Duration::from_millis(500),
        };
        let conn = DeviceConnection::with_connector(Arc::new(mock.clone()), timing);
        conn.connect(params()).await.unwrap();
        let mut rx = conn.subscribe();

        // Silence limit is 1000 ms x 3 retries; first breach is seen at 3.5 s.
        sleep(Duration::from_millis(5200)).await;
        assert_eq!(mock.opens(), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(
            drain(&mut rx)
                .iter()
                .filter(|e| **e == ConnectionEvent::Connected)
                .count(),
            1
        );

        sleep(Duration::from_millis(2000)).await;
        assert_eq!(mock.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_traffic_keeps_the_session() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        for _ in 0..10 {
            conn.read_coils(0, 1).unwrap();
            sleep(Duration::from_millis(1000)).await;
        }
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_gives_up_when_the_device_is_gone() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        let mut rx = conn.subscribe();
        mock.state().refuse_open = true;

        sleep(Duration::from_millis(5100)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&ConnectionEvent::Disconnected));
        assert!(matches!(conn.read_coils(0, 1), Err(ConnError::NotConnected)));

        mock.state().refuse_open = false;
        conn.reconnect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_discards_queue_but_lets_in_flight_finish() {
        let (conn, mock) = setup();
        conn.connect(params()).await.unwrap();
        mock.delay_next(Duration::from_millis(100));

        let first = conn
            .submit(Request::read(RegisterKind::HoldingRegister, 0, 1))
            .unwrap();
        let second = conn
            .submit(Request::read(RegisterKind::HoldingRegister, 1, 1))
            .unwrap();
        conn.read_holding_registers(2, 1).unwrap();
        sleep(Duration::from_millis(20)).await;

        let mut rx = conn.subscribe();
        conn.disconnect().await;

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.is_err());
        assert_eq!(mock.calls().len(), 1);
        assert_eq!(mock.state().closes, 1);
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(drain(&mut rx).contains(&ConnectionEvent::Disconnected));

        // Disconnecting twice is harmless and silent.
        conn.disconnect().await;
        assert!(drain(&mut rx).is_empty());
    }
}
