use async_trait::async_trait;
use serde::Deserialize;
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::timeout,
};
use tokio_modbus::{
    client::Context,
    prelude::{Client, Request, Response},
    slave::{Slave, SlaveContext},
};
use tracing::{debug, error, info};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can open a Modbus transport.
#[async_trait]
pub trait Endpoint: fmt::Debug + Send + Sync {
    /// Identity of the physical link. Two endpoints with the same id share one [`Connection`].
    fn id(&self) -> String;

    async fn open(&self) -> io::Result<Context>;
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum ModbusProto {
    #[cfg(feature = "tcp")]
    Tcp {
        host: String,

        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    #[cfg(feature = "rtu")]
    #[serde(rename_all = "lowercase")]
    Rtu {
        tty: String,
        baud_rate: u32,

        #[serde(default = "default_modbus_data_bits")]
        data_bits: tokio_serial::DataBits,

        #[serde(default = "default_modbus_stop_bits")]
        stop_bits: tokio_serial::StopBits,

        #[serde(default = "default_modbus_flow_control")]
        flow_control: tokio_serial::FlowControl,

        #[serde(default = "default_modbus_parity")]
        parity: tokio_serial::Parity,
    },

    // Predominantly for if the binary is compiled with no default features for some reason.
    #[serde(other)]
    Unknown,
}

impl ModbusProto {
    /// Whether this is a network link. Battery stacks are only reachable on the LAN port.
    pub fn is_tcp(&self) -> bool {
        #[cfg(feature = "tcp")]
        if let ModbusProto::Tcp { .. } = self {
            return true;
        }
        false
    }
}

#[async_trait]
impl Endpoint for ModbusProto {
    fn id(&self) -> String {
        match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => format!("tcp:{host}:{port}"),
            #[cfg(feature = "rtu")]
            ModbusProto::Rtu { ref tty, .. } => format!("rtu:{tty}"),
            ModbusProto::Unknown => "unknown".to_owned(),
        }
    }

    async fn open(&self) -> io::Result<Context> {
        #[cfg(feature = "rtu")]
        use tokio_modbus::client::rtu;
        #[cfg(feature = "tcp")]
        use tokio_modbus::client::tcp;

        match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{host} did not resolve"))
                    })?;
                tcp::connect(socket_addr).await
            }

            #[cfg(feature = "rtu")]
            ModbusProto::Rtu {
                ref tty,
                baud_rate,
                data_bits,
                stop_bits,
                flow_control,
                parity,
            } => {
                let builder = tokio_serial::new(tty, baud_rate)
                    .data_bits(data_bits)
                    .flow_control(flow_control)
                    .parity(parity)
                    .stop_bits(stop_bits);
                let port = tokio_serial::SerialStream::open(&builder)?;
                rtu::connect(port).await
            }

            ModbusProto::Unknown => {
                error!("Unrecognised protocol");
                Err(crate::Error::UnrecognisedModbusProtocol.into())
            }
        }
    }
}

/// Transport-level failures. The link is dropped and reopened on the next attempt. Anything else
/// (notably exception responses) is a protocol error and leaves the link alone.
pub fn is_connection_error(error: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        error.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | UnexpectedEof
            | AddrNotAvailable
    )
}

/// One physical link, shared by every device controller talking through it.
///
/// The transport sits behind an async mutex which doubles as the link's exclusive I/O lock: only
/// one request is ever in flight per connection.
pub struct Connection {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    transport: Mutex<Option<Context>>,
    connected: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            id: endpoint.id(),
            endpoint,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Opens the transport unless it is already open.
    pub async fn connect(&self) -> io::Result<()> {
        let mut transport = self.transport.lock().await;
        if transport.is_some() {
            return Ok(());
        }

        debug!(connection = %self.id, "Connecting");
        let context = timeout(CONNECT_TIMEOUT, self.endpoint.open()).await??;
        *transport = Some(context);
        self.connected.store(true, Ordering::Release);
        info!(connection = %self.id, "Connected");
        Ok(())
    }

    /// Takes the exclusive I/O lock.
    pub async fn lock(&self) -> Transport<'_> {
        Transport {
            connection: self,
            guard: self.transport.lock().await,
        }
    }

    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        if transport.take().is_some() {
            info!(connection = %self.id, "Closed");
        }
        self.connected.store(false, Ordering::Release);
    }
}

/// Exclusive access to an open (or dropped) transport for the duration of one or more requests.
pub struct Transport<'a> {
    connection: &'a Connection,
    guard: MutexGuard<'a, Option<Context>>,
}

impl Transport<'_> {
    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    /// Issues a single request addressed to `slave`. Connection failures drop the transport so
    /// the next attempt reconnects.
    pub async fn call(&mut self, slave: Slave, request: Request) -> io::Result<Response> {
        self.exchange(slave, request, is_connection_error).await
    }

    /// Like [`Transport::call`], for slaves that may legitimately be missing behind the link. A
    /// timeout only means nothing answered on that id and leaves the transport open.
    pub async fn call_peer(&mut self, slave: Slave, request: Request) -> io::Result<Response> {
        self.exchange(slave, request, |error| {
            error.kind() != io::ErrorKind::TimedOut && is_connection_error(error)
        })
        .await
    }

    async fn exchange(
        &mut self,
        slave: Slave,
        request: Request,
        drops_link: fn(&io::Error) -> bool,
    ) -> io::Result<Response> {
        let context = self
            .guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        context.set_slave(slave);

        let result = match timeout(IO_TIMEOUT, context.call(request)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        if let Err(ref error) = result {
            if drops_link(error) {
                debug!(connection = %self.connection.id, ?error, "Dropping transport");
                self.guard.take();
                self.connection.connected.store(false, Ordering::Release);
            }
        }
        result
    }
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_data_bits() -> tokio_serial::DataBits {
    tokio_serial::DataBits::Eight
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_stop_bits() -> tokio_serial::StopBits {
    tokio_serial::StopBits::One
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_flow_control() -> tokio_serial::FlowControl {
    tokio_serial::FlowControl::None
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_parity() -> tokio_serial::Parity {
    tokio_serial::Parity::None
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_minimal_tcp_connect_config() {
    use serde_json::json;
    let proto = serde_json::from_value::<ModbusProto>(json!({
        "proto": "tcp",
        "host": "1.1.1.1"
    }))
    .unwrap();

    assert!(matches!(
        proto,
        ModbusProto::Tcp {
            ref host,
            port: 502
        } if host == "1.1.1.1"
    ));
    assert!(proto.is_tcp());
    assert_eq!(proto.id(), "tcp:1.1.1.1:502");
}

#[cfg(feature = "rtu")]
#[test]
fn parse_minimal_rtu_connect_config() {
    use serde_json::json;
    let proto = serde_json::from_value::<ModbusProto>(json!({
        "proto": "rtu",
        "tty": "/dev/ttyUSB0",
        "baud_rate": 9600,
    }))
    .unwrap();

    use tokio_serial::*;
    assert!(matches!(
        proto,
        ModbusProto::Rtu {
            ref tty,
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            parity: Parity::None,
        } if tty == "/dev/ttyUSB0"
    ));
    assert!(!proto.is_tcp());
    assert_eq!(proto.id(), "rtu:/dev/ttyUSB0");
}

#[cfg(feature = "rtu")]
#[test]
fn parse_complete_rtu_connect_config() {
    use serde_json::json;
    let proto = serde_json::from_value::<ModbusProto>(json!({
        "proto": "rtu",
        "tty": "/dev/ttyUSB0",
        "baud_rate": 12800,
        "data_bits": "Seven",
        "stop_bits": "Two",
        "flow_control": "Software",
        "parity": "Even",
    }))
    .unwrap();

    use tokio_serial::*;
    assert!(matches!(
        proto,
        ModbusProto::Rtu {
            baud_rate: 12800,
            data_bits: DataBits::Seven,
            stop_bits: StopBits::Two,
            flow_control: FlowControl::Software,
            parity: Parity::Even,
            ..
        }
    ));
}

#[test]
fn unknown_protocols_parse_but_never_open() {
    let proto = serde_json::from_value::<ModbusProto>(serde_json::json!({ "proto": "carrier-pigeon" }))
        .unwrap();
    assert!(matches!(proto, ModbusProto::Unknown));
}

#[test]
fn classify_transport_errors() {
    use io::ErrorKind;
    for kind in [
        ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset,
        ErrorKind::TimedOut,
        ErrorKind::BrokenPipe,
        ErrorKind::UnexpectedEof,
    ] {
        assert!(is_connection_error(&io::Error::from(kind)), "{kind:?}");
    }
    // exception responses surface as `Other`
    assert!(!is_connection_error(&io::Error::new(
        ErrorKind::Other,
        "Modbus function 4: Illegal data address"
    )));
    assert!(!is_connection_error(&io::Error::from(ErrorKind::InvalidData)));
}

#[tokio::test]
async fn failed_requests_drop_the_transport() {
    use super::mock::MockDevice;

    let device = MockDevice::new("mock:drop");
    let connection = Connection::new(Arc::new(device.clone()));
    assert!(!connection.is_connected());

    connection.connect().await.unwrap();
    assert!(connection.is_connected());

    device.set_absent(Slave(3));
    {
        let mut transport = connection.lock().await;
        let result = transport
            .call(Slave(3), Request::ReadInputRegisters(10740, 1))
            .await;
        assert!(result.is_err());
        assert!(transport.is_open(), "exception responses keep the link");
    }

    device.fail_requests(io::ErrorKind::ConnectionReset);
    {
        let mut transport = connection.lock().await;
        let result = transport
            .call(Slave(1), Request::ReadInputRegisters(5000, 1))
            .await;
        assert!(result.is_err());
        assert!(!transport.is_open());
    }
    assert!(!connection.is_connected());
    assert_eq!(device.opens(), 1);
}

#[tokio::test]
async fn silent_peers_keep_the_transport() {
    use super::mock::MockDevice;

    let device = MockDevice::new("mock:peer");
    let connection = Connection::new(Arc::new(device.clone()));
    connection.connect().await.unwrap();
    device.set_silent(Slave(201));

    let mut transport = connection.lock().await;
    let error = transport
        .call_peer(Slave(201), Request::ReadInputRegisters(10740, 1))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    assert!(transport.is_open());

    // the same silence on the link's own slave is a lost link
    device.set_silent(Slave(1));
    let result = transport
        .call(Slave(1), Request::ReadInputRegisters(5000, 1))
        .await;
    assert!(result.is_err());
    assert!(!transport.is_open());
}
