mod shutdown;

pub mod battery;
pub mod cache;
pub mod config;
pub mod event;
pub mod hub;
pub mod modbus;
pub mod mqtt;
pub mod scheduler;
pub mod server;

pub use shutdown::{Shutdown, Trigger};

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
