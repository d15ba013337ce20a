use serde::Serialize;

use crate::{
    battery::BatteryStack,
    modbus::{codec::Value, UnitId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectState {
    Connected,
    Disconnected,
    /// Connection attempts are suspended by the circuit breaker
    Blocked,
}

/// Everything the engine reports to the outside world.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Value {
        device: String,
        connection: String,
        slave: UnitId,
        name: String,
        register: u16,
        value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    Status {
        device: String,
        state: ConnectState,
    },
    Battery {
        device: String,
        stack: BatteryStack,
    },
}

impl Event {
    pub fn device(&self) -> &str {
        match self {
            Event::Value { device, .. } | Event::Status { device, .. } | Event::Battery { device, .. } => {
                device
            }
        }
    }
}
