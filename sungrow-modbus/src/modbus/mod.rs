pub mod breaker;
pub mod codec;
pub mod connection;
pub mod controller;
pub mod pool;
pub mod register;
pub mod write_queue;

#[cfg(test)]
pub(crate) mod mock;

pub type UnitId = tokio_modbus::prelude::SlaveId;
pub use tokio_modbus::prelude::Slave as Unit;
