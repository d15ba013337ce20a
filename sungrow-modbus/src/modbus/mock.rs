//! In-memory Modbus device wrapped in a real `tokio_modbus` [`Context`], for exercising the
//! transport path without sockets.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_modbus::{
    client::Context,
    prelude::{Client, Request, Response},
    slave::{Slave, SlaveContext},
};

use super::{
    connection::Endpoint,
    register::RegisterKind::{self, *},
};

#[derive(Debug, Default)]
struct MockState {
    id: String,
    registers: HashMap<(RegisterKind, u8, u16), u16>,
    absent: HashSet<u8>,
    silent: HashSet<u8>,
    reads: usize,
    writes: Vec<(u8, u16, Vec<u16>)>,
    opens: usize,
    refuse_connect: bool,
    fail_requests: Option<io::ErrorKind>,
    read_delay: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new(id: &str) -> Self {
        let state = MockState {
            id: id.to_owned(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_registers(&self, kind: RegisterKind, slave: u8, start: u16, words: &[u16]) {
        let mut state = self.state();
        for (offset, word) in words.iter().enumerate() {
            state
                .registers
                .insert((kind, slave, start + offset as u16), *word);
        }
    }

    pub fn set_input(&self, slave: u8, start: u16, words: &[u16]) {
        self.set_registers(Input, slave, start, words)
    }

    pub fn set_holding(&self, slave: u8, start: u16, words: &[u16]) {
        self.set_registers(Holding, slave, start, words)
    }

    pub fn holding(&self, slave: u8, address: u16) -> Option<u16> {
        self.state()
            .registers
            .get(&(Holding, slave, address))
            .copied()
    }

    /// Requests addressed to `slave` fail with an exception response.
    pub fn set_absent(&self, slave: Slave) {
        self.state().absent.insert(slave.0);
    }

    /// Requests addressed to `slave` time out, as when nothing answers on a gateway.
    pub fn set_silent(&self, slave: Slave) {
        self.state().silent.insert(slave.0);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Every request fails with `kind` until [`MockDevice::recover`].
    pub fn fail_requests(&self, kind: io::ErrorKind) {
        self.state().fail_requests = Some(kind);
    }

    pub fn recover(&self) {
        let mut state = self.state();
        state.fail_requests = None;
        state.refuse_connect = false;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    pub fn writes(&self) -> Vec<(u8, u16, Vec<u16>)> {
        self.state().writes.clone()
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }
}

#[async_trait]
impl Endpoint for MockDevice {
    fn id(&self) -> String {
        self.state().id.clone()
    }

    async fn open(&self) -> io::Result<Context> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        state.opens += 1;

        let client: Box<dyn Client> = Box::new(MockClient {
            state: Arc::clone(&self.state),
            slave: 1,
        });
        Ok(Context::from(client))
    }
}

#[derive(Debug)]
struct MockClient {
    state: Arc<Mutex<MockState>>,
    slave: u8,
}

impl MockClient {
    fn read(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<u16> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        (start..start + count)
            .map(|address| {
                state
                    .registers
                    .get(&(kind, self.slave, address))
                    .copied()
                    .unwrap_or_default()
            })
            .collect()
    }

    fn write(&self, start: u16, words: Vec<u16>) {
        let mut state = self.state.lock().unwrap();
        for (offset, word) in words.iter().enumerate() {
            state
                .registers
                .insert((Holding, self.slave, start + offset as u16), *word);
        }
        state.writes.push((self.slave, start, words));
    }
}

#[async_trait]
impl Client for MockClient {
    async fn call(&mut self, request: Request) -> io::Result<Response> {
        let delay = {
            let state = self.state.lock().unwrap();
            if let Some(kind) = state.fail_requests {
                return Err(kind.into());
            }
            if state.silent.contains(&self.slave) {
                return Err(io::ErrorKind::TimedOut.into());
            }
            if state.absent.contains(&self.slave) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "Gateway target device failed to respond",
                ));
            }
            state.read_delay
        };

        use Request::*;
        match request {
            ReadInputRegisters(start, count) | ReadHoldingRegisters(start, count) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(match request {
                    ReadInputRegisters(..) => {
                        Response::ReadInputRegisters(self.read(Input, start, count))
                    }
                    _ => Response::ReadHoldingRegisters(self.read(Holding, start, count)),
                })
            }
            WriteSingleRegister(address, word) => {
                self.write(address, vec![word]);
                Ok(Response::WriteSingleRegister(address, word))
            }
            WriteMultipleRegisters(start, words) => {
                let count = words.len() as u16;
                self.write(start, words);
                Ok(Response::WriteMultipleRegisters(start, count))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "Illegal function",
            )),
        }
    }
}

impl SlaveContext for MockClient {
    fn set_slave(&mut self, slave: Slave) {
        self.slave = slave.0;
    }
}
