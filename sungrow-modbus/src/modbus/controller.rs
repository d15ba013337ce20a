use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_modbus::prelude::{Request, Response};
use tracing::{debug, error, info, warn};

use super::{
    breaker::{BreakerConfig, BreakerState, CircuitBreaker},
    codec::Value,
    connection::{is_connection_error, Connection, Endpoint},
    register::RegisterKind,
    write_queue::{WriteAck, WriteCommand, WriteExecutor, WriteQueue},
    Unit,
};
use crate::{
    event::{ConnectState, Event},
    hub::Hub,
    shutdown::Shutdown,
};

/// Minimum spacing between a controller's consecutive Modbus operations.
pub const READ_DELAY: Duration = Duration::from_millis(50);
pub const WRITE_DELAY: Duration = Duration::from_millis(100);

/// Talks to one Modbus slave over a (possibly shared) pooled connection.
///
/// Connection attempts are gated by a [`CircuitBreaker`]; every request holds the connection's
/// I/O lock and is spaced from the previous one by the inter-frame delay. Writes are never issued
/// directly: they are queued and executed one at a time by [`DeviceController::spawn_write_queue`].
pub struct DeviceController {
    name: String,
    key: String,
    slave: Unit,
    connection: Arc<Connection>,
    hub: Hub,
    breaker: Mutex<CircuitBreaker>,
    writes: WriteQueue,
    enabled: AtomicBool,
    data_received: AtomicBool,
    connect_failures: AtomicU32,
    last_success: Mutex<Option<Instant>>,
    last_request: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceController {
    pub fn new<N: Into<String>>(
        name: N,
        endpoint: Arc<dyn Endpoint>,
        slave: Unit,
        breaker: BreakerConfig,
        hub: Hub,
    ) -> Self {
        let name = name.into();
        let connection = hub.pool().acquire(endpoint);
        let key = format!("{}_{}", connection.id(), slave.0);

        Self {
            breaker: Mutex::new(CircuitBreaker::new(name.clone(), breaker)),
            writes: WriteQueue::new(name.clone()),
            name,
            key,
            slave,
            connection,
            hub,
            enabled: AtomicBool::new(true),
            data_received: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            last_success: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"{connection}_{slave}"`, unique per physical device. Namespaces the register cache.
    pub fn device_key(&self) -> &str {
        &self.key
    }

    pub fn slave(&self) -> Unit {
        self.slave
    }

    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connect_state(&self) -> ConnectState {
        if self.connected() {
            ConnectState::Connected
        } else if lock(&self.breaker).is_open() {
            ConnectState::Blocked
        } else {
            ConnectState::Disconnected
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        lock(&self.breaker).state()
    }

    pub fn connect_failures(&self) -> u32 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn last_success(&self) -> Option<Instant> {
        *lock(&self.last_success)
    }

    /// Whether any read has ever succeeded.
    pub fn data_received(&self) -> bool {
        self.data_received.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        info!(device = %self.name, "Polling enabled");
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        info!(device = %self.name, "Polling disabled");
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Makes sure the transport is open, if the circuit breaker allows an attempt.
    pub async fn connect(&self) -> bool {
        if self.connection.is_connected() {
            return true;
        }

        {
            let mut breaker = lock(&self.breaker);
            if !breaker.can_attempt() {
                debug!(
                    device = %self.name,
                    retry_in = ?breaker.time_until_retry(),
                    "Connection attempt suppressed by circuit breaker"
                );
                return false;
            }
        }

        match self.connection.connect().await {
            Ok(()) => {
                lock(&self.breaker).record_success();
                self.connect_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(error) => {
                let failures = self.connect_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(device = %self.name, %error, failures, "Connection failed");
                lock(&self.breaker).record_failure();
                false
            }
        }
    }

    pub async fn read_input_registers(&self, start: u16, count: u16) -> Option<Vec<u16>> {
        self.read(RegisterKind::Input, start, count).await
    }

    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Option<Vec<u16>> {
        self.read(RegisterKind::Holding, start, count).await
    }

    pub async fn read(&self, kind: RegisterKind, start: u16, count: u16) -> Option<Vec<u16>> {
        self.read_as(self.slave, kind, start, count).await
    }

    /// Reads from another slave id reachable through this controller's transport, sharing its
    /// lock and request spacing. Failures on another slave id are expected while probing and never
    /// count against this controller's circuit breaker.
    pub(crate) async fn read_as(
        &self,
        slave: Unit,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Option<Vec<u16>> {
        if !self.connect().await {
            return None;
        }

        let request = match kind {
            RegisterKind::Input => Request::ReadInputRegisters(start, count),
            RegisterKind::Holding => Request::ReadHoldingRegisters(start, count),
        };

        let words = match self.request(slave, request, READ_DELAY).await? {
            Response::ReadInputRegisters(words) | Response::ReadHoldingRegisters(words) => words,
            response => {
                error!(device = %self.name, ?response, "Unexpected response to read");
                return None;
            }
        };

        if words.len() != count as usize {
            error!(
                device = %self.name,
                start,
                count,
                received = words.len(),
                "Short read"
            );
            return None;
        }

        self.record_success();
        self.data_received.store(true, Ordering::Relaxed);
        Some(words)
    }

    pub async fn write_single(&self, register: u16, value: u16) -> Option<WriteAck> {
        self.writes
            .submit(WriteCommand::Single { register, value })
            .await
    }

    pub async fn write_multiple(&self, start: u16, values: Vec<u16>) -> Option<WriteAck> {
        self.writes
            .submit(WriteCommand::Multiple { start, values })
            .await
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.writes
    }

    /// Starts the single consumer of this controller's write queue.
    pub fn spawn_write_queue(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.writes.consume(controller.as_ref(), shutdown).await })
    }

    /// Gives up this controller's share of the pooled connection.
    pub async fn close(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.hub.pool().release(self.connection.id()).await;
    }

    /// Holds the connection lock, waits out the inter-frame delay and issues `request`.
    async fn request(&self, slave: Unit, request: Request, delay: Duration) -> Option<Response> {
        let mut transport = self.connection.lock().await;

        let previous = *lock(&self.last_request);
        if let Some(at) = previous {
            sleep_until(at + delay).await;
        }

        let peer = slave != self.slave;
        let result = if peer {
            transport.call_peer(slave, request).await
        } else {
            transport.call(slave, request).await
        };
        *lock(&self.last_request) = Some(Instant::now());

        match result {
            Ok(response) => Some(response),
            Err(error) if peer => {
                debug!(device = %self.name, slave = slave.0, %error, "No answer from peer slave");
                None
            }
            Err(error) if is_connection_error(&error) => {
                warn!(device = %self.name, slave = slave.0, %error, "Connection lost");
                lock(&self.breaker).record_failure();
                None
            }
            Err(error) => {
                error!(device = %self.name, slave = slave.0, %error, "Modbus request failed");
                None
            }
        }
    }

    fn record_success(&self) {
        *lock(&self.last_success) = Some(Instant::now());
    }
}

#[async_trait]
impl WriteExecutor for DeviceController {
    fn is_connected(&self) -> bool {
        self.connected()
    }

    async fn execute(&self, command: &WriteCommand) -> Option<WriteAck> {
        if !self.connect().await {
            return None;
        }

        let request = match *command {
            WriteCommand::Single { register, value } => Request::WriteSingleRegister(register, value),
            WriteCommand::Multiple { start, ref values } => {
                Request::WriteMultipleRegisters(start, values.clone())
            }
        };

        let ack = match self.request(self.slave, request, WRITE_DELAY).await? {
            Response::WriteSingleRegister(address, value)
            | Response::WriteMultipleRegisters(address, value) => WriteAck { address, value },
            response => {
                error!(device = %self.name, ?response, "Unexpected response to write");
                return None;
            }
        };
        self.record_success();

        let values = command.values();
        self.hub
            .cache()
            .invalidate_range(&self.key, command.start(), values.len() as u16);
        info!(device = %self.name, ?command, "Write acknowledged");

        for (offset, value) in values.iter().enumerate() {
            let register = command.start().wrapping_add(offset as u16);
            self.hub.emit(Event::Value {
                device: self.name.clone(),
                connection: self.connection.id().to_owned(),
                slave: self.slave.0,
                name: register.to_string(),
                register,
                value: Value::from(rust_decimal::Decimal::from(*value)),
                unit: None,
            });
        }
        Some(ack)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn controller(device: &super::mock::MockDevice, slave: u8, hub: &Hub) -> DeviceController {
    DeviceController::new(
        format!("inverter-{slave}"),
        Arc::new(device.clone()),
        Unit(slave),
        BreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        },
        hub.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn reads_are_spaced_and_tracked() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    device.set_input(1, 5000, &[1, 2, 3]);
    let hub = Hub::default();
    let controller = controller(&device, 1, &hub);

    assert!(!controller.data_received());
    assert_eq!(controller.device_key(), "tcp:inverter:502_1");

    let started = Instant::now();
    assert_eq!(controller.read_input_registers(5000, 3).await, Some(vec![1, 2, 3]));
    assert_eq!(controller.read_input_registers(5001, 2).await, Some(vec![2, 3]));
    assert!(started.elapsed() >= READ_DELAY);

    assert!(controller.data_received());
    assert!(controller.last_success().is_some());
    assert_eq!(controller.connect_state(), ConnectState::Connected);
}

#[tokio::test]
async fn exception_responses_return_none_and_keep_the_link() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let controller = controller(&device, 4, &hub);
    device.set_absent(Unit(4));

    assert_eq!(controller.read_holding_registers(13049, 1).await, None);
    assert!(controller.connected());
    assert_eq!(controller.breaker_state(), BreakerState::Closed);
    assert!(!controller.data_received());
}

#[tokio::test(start_paused = true)]
async fn breaker_suppresses_connection_attempts() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    device.refuse_connections(true);
    let hub = Hub::default();
    let controller = controller(&device, 1, &hub);

    assert!(!controller.connect().await);
    assert_eq!(controller.connect_state(), ConnectState::Disconnected);
    assert!(!controller.connect().await);
    assert_eq!(controller.breaker_state(), BreakerState::Open);
    assert_eq!(controller.connect_state(), ConnectState::Blocked);

    // rejected without touching the transport or counting as a failure
    device.recover();
    assert_eq!(controller.read_input_registers(5000, 1).await, None);
    assert_eq!(controller.connect_failures(), 2);
    assert_eq!(device.opens(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(controller.connect().await);
    assert_eq!(controller.breaker_state(), BreakerState::Closed);
    assert_eq!(controller.connect_failures(), 0);
    assert_eq!(device.opens(), 1);
}

#[tokio::test]
async fn connect_failures_reset_after_success() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    device.refuse_connections(true);
    let hub = Hub::default();
    let controller = controller(&device, 1, &hub);

    assert!(!controller.connect().await);
    assert_eq!(controller.connect_failures(), 1);

    device.recover();
    assert!(controller.connect().await);
    assert_eq!(controller.connect_failures(), 0);
}

#[tokio::test]
async fn peer_slave_failures_spare_the_link_and_breaker() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let controller = controller(&device, 1, &hub);
    device.set_silent(Unit(200));
    device.set_silent(Unit(201));

    assert!(controller.connect().await);
    for slave in [200, 201, 200] {
        assert_eq!(
            controller.read_as(Unit(slave), RegisterKind::Input, 10740, 1).await,
            None
        );
    }
    assert!(controller.connected());
    assert_eq!(lock(&controller.breaker).failure_count(), 0);

    // a dropped link still ends the request, but only the device's own reads charge the breaker
    device.fail_requests(std::io::ErrorKind::ConnectionReset);
    assert_eq!(
        controller.read_as(Unit(200), RegisterKind::Input, 10740, 1).await,
        None
    );
    assert!(!controller.connected());
    assert_eq!(lock(&controller.breaker).failure_count(), 0);

    device.recover();
    assert!(controller.read_input_registers(5000, 1).await.is_some());
    assert_eq!(device.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn writes_are_spaced_from_neighbouring_requests() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let controller = Arc::new(controller(&device, 1, &hub));
    assert!(controller.connect().await);

    let trigger = crate::shutdown::Trigger::new();
    let consumer = controller.spawn_write_queue(trigger.subscribe());

    assert!(controller.read_holding_registers(13049, 1).await.is_some());
    let read_at = Instant::now();
    assert!(controller.write_single(13049, 2).await.is_some());
    assert!(read_at.elapsed() >= WRITE_DELAY);

    let written_at = Instant::now();
    assert!(controller.write_single(13050, 3).await.is_some());
    assert!(written_at.elapsed() >= WRITE_DELAY);

    let written_at = Instant::now();
    assert!(controller.read_holding_registers(13049, 2).await.is_some());
    assert!(written_at.elapsed() >= READ_DELAY);

    trigger.fire();
    consumer.await.unwrap();
}

#[tokio::test]
async fn lost_connections_reconnect_on_next_read() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let controller = controller(&device, 1, &hub);

    assert!(controller.read_input_registers(5000, 1).await.is_some());
    device.fail_requests(std::io::ErrorKind::BrokenPipe);
    assert_eq!(controller.read_input_registers(5000, 1).await, None);
    assert!(!controller.connected());

    device.recover();
    assert!(controller.read_input_registers(5000, 1).await.is_some());
    assert_eq!(device.opens(), 2);
}

#[tokio::test]
async fn writes_go_through_the_queue() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let mut events = hub.subscribe();
    let controller = Arc::new(controller(&device, 1, &hub));
    assert!(controller.connect().await);

    let trigger = crate::shutdown::Trigger::new();
    let consumer = controller.spawn_write_queue(trigger.subscribe());

    hub.cache()
        .set_range(controller.device_key(), 13049, &[0, 0], Duration::from_secs(60));

    let ack = controller.write_single(13049, 2).await;
    assert_eq!(ack, Some(WriteAck { address: 13049, value: 2 }));
    let ack = controller.write_multiple(13050, vec![7, 8]).await;
    assert_eq!(ack, Some(WriteAck { address: 13050, value: 2 }));

    assert_eq!(device.holding(1, 13049), Some(2));
    assert_eq!(device.holding(1, 13051), Some(8));
    assert_eq!(
        device.writes(),
        vec![(1, 13049, vec![2]), (1, 13050, vec![7, 8])]
    );
    assert_eq!(hub.cache().get(controller.device_key(), 13049), None);
    assert_eq!(hub.cache().get(controller.device_key(), 13050), None);

    match events.recv().await.unwrap() {
        Event::Value { register, value, .. } => {
            assert_eq!(register, 13049);
            assert_eq!(value, Value::from(rust_decimal::Decimal::from(2)));
        }
        other => panic!("unexpected event {other:?}"),
    }

    trigger.fire();
    consumer.await.unwrap();
}

#[tokio::test]
async fn controllers_share_pooled_connections() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let hub = Hub::default();
    let first = controller(&device, 1, &hub);
    let second = controller(&device, 2, &hub);
    assert_eq!(hub.pool().ref_count("tcp:inverter:502"), 2);

    assert!(first.connect().await);
    assert!(second.connected());
    assert_ne!(first.device_key(), second.device_key());

    first.close().await;
    assert!(second.connected());
    second.close().await;
    assert!(!second.connected());
    assert!(hub.pool().is_empty());
    assert_eq!(device.opens(), 1);
}

#[test]
fn enable_and_disable() {
    let device = super::mock::MockDevice::new("tcp:inverter:502");
    let controller = controller(&device, 1, &Hub::default());
    assert!(controller.is_enabled());
    controller.disable();
    assert!(!controller.is_enabled());
    controller.enable();
    assert!(controller.is_enabled());
}
