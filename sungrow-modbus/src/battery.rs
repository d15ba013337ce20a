//! Battery stacks behind an inverter answer on their own slave ids (200 and up) over the
//! inverter's LAN connection. Discovery probes them in order and reads their identity once; the
//! status block is then re-read on every slow poll.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::modbus::{
    codec::{decode_string, scale, to_signed16},
    controller::DeviceController,
    register::RegisterKind,
    Unit, UnitId,
};

pub const BASE_SLAVE: UnitId = 200;
pub const MAX_STACKS: u8 = 4;

const SERIAL: (u16, u16) = (10710, 10);
const FIRMWARE: (u16, u16) = (10720, 10);
const STATUS: (u16, u16) = (10740, 20);
/// Voltage register, the first of the status block
const PROBE: (u16, u16) = (10740, 1);

const MODULE_SERIAL_BASE: u16 = 10821;
const MODULE_SERIAL_STRIDE: u16 = 9;
const MAX_MODULES: u16 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct DiscoveryOptions {
    #[serde(default = "default_max_stacks")]
    pub max_stacks: u8,

    /// Stacks are numbered contiguously, so the first missing one ends the probe.
    #[serde(default = "default_stop_at_first_gap")]
    pub stop_at_first_gap: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            max_stacks: MAX_STACKS,
            stop_at_first_gap: true,
        }
    }
}

fn default_max_stacks() -> u8 {
    MAX_STACKS
}

fn default_stop_at_first_gap() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatteryModule {
    pub index: u16,
    pub serial_number: String,
}

/// Latest readings of a stack's status block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatteryStatus {
    pub voltage: Decimal,
    pub current: Decimal,
    pub temperature: Decimal,
    pub soc: Decimal,
    pub soh: Decimal,
    pub total_charge_energy: Decimal,
    pub total_discharge_energy: Decimal,
    pub cell_voltage_max: Decimal,
    pub cell_voltage_max_position: u16,
    pub cell_voltage_min: Decimal,
    pub cell_voltage_min_position: u16,
}

impl BatteryStatus {
    fn decode(words: &[u16]) -> Option<Self> {
        let tenth = Decimal::new(1, 1);
        let ten_thousandth = Decimal::new(1, 4);
        let u32_at = |i: usize| ((words[i] as u32) << 16 | words[i + 1] as u32) as i64;

        if words.len() < STATUS.1 as usize {
            return None;
        }
        Some(Self {
            voltage: scale(words[0].into(), tenth),
            current: scale(to_signed16(words[1]).into(), tenth),
            temperature: scale(words[2].into(), tenth),
            soc: scale(words[3].into(), tenth),
            soh: words[4].into(),
            total_charge_energy: scale(u32_at(5), tenth),
            total_discharge_energy: scale(u32_at(7), tenth),
            cell_voltage_max: scale(words[16].into(), ten_thousandth),
            cell_voltage_max_position: words[17],
            cell_voltage_min: scale(words[18].into(), ten_thousandth),
            cell_voltage_min_position: words[19],
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatteryStack {
    pub index: u8,
    pub slave: UnitId,
    pub serial_number: String,
    pub firmware_version: String,
    pub modules: Vec<BatteryModule>,
    #[serde(flatten)]
    pub status: Option<BatteryStatus>,
}

impl BatteryStack {
    fn new(index: u8) -> Self {
        Self {
            index,
            slave: BASE_SLAVE + index,
            serial_number: String::new(),
            firmware_version: String::new(),
            modules: vec![],
            status: None,
        }
    }

    fn unit(&self) -> Unit {
        Unit(self.slave)
    }

    async fn read(&self, controller: &DeviceController, (start, count): (u16, u16)) -> Option<Vec<u16>> {
        controller
            .read_as(self.unit(), RegisterKind::Input, start, count)
            .await
    }

    async fn probe(&self, controller: &DeviceController) -> bool {
        self.read(controller, PROBE).await.is_some()
    }

    async fn read_identity(&mut self, controller: &DeviceController) {
        if let Some(words) = self.read(controller, SERIAL).await {
            self.serial_number = decode_string(&words);
        }
        if let Some(words) = self.read(controller, FIRMWARE).await {
            self.firmware_version = decode_string(&words);
        }
    }

    async fn read_modules(&mut self, controller: &DeviceController) {
        self.modules.clear();
        for index in 0..MAX_MODULES {
            let start = MODULE_SERIAL_BASE + index * MODULE_SERIAL_STRIDE;
            let Some(words) = self.read(controller, (start, MODULE_SERIAL_STRIDE)).await else {
                continue;
            };
            let serial_number = decode_string(&words);
            if serial_number.is_empty() {
                break;
            }
            self.modules.push(BatteryModule {
                index,
                serial_number,
            });
        }
    }

    /// Refreshes the status block. Returns `false` (keeping the previous readings) on failure.
    pub async fn poll(&mut self, controller: &DeviceController) -> bool {
        match self
            .read(controller, STATUS)
            .await
            .as_deref()
            .and_then(BatteryStatus::decode)
        {
            Some(status) => {
                self.status = Some(status);
                true
            }
            None => false,
        }
    }
}

/// Probes battery stacks behind `controller`, reading the identity of each one found.
#[tracing::instrument(level = "debug", skip_all, fields(device = %controller.name()))]
pub async fn discover(controller: &DeviceController, options: DiscoveryOptions) -> Vec<BatteryStack> {
    let mut stacks = vec![];

    for index in 0..options.max_stacks {
        let mut stack = BatteryStack::new(index);

        if !stack.probe(controller).await {
            debug!(index, slave = stack.slave, "No battery stack");
            if options.stop_at_first_gap {
                break;
            }
            continue;
        }

        stack.read_identity(controller).await;
        stack.read_modules(controller).await;
        info!(
            index,
            slave = stack.slave,
            serial = %stack.serial_number,
            firmware = %stack.firmware_version,
            modules = stack.modules.len(),
            "Detected battery stack"
        );
        stacks.push(stack);
    }

    stacks
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn ascii(text: &str, width: usize) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(width * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
fn inverter() -> (crate::modbus::mock::MockDevice, DeviceController) {
    use crate::{hub::Hub, modbus::breaker::BreakerConfig};
    use std::sync::Arc;

    let device = crate::modbus::mock::MockDevice::new("tcp:inverter:502");
    let controller = DeviceController::new(
        "inverter",
        Arc::new(device.clone()),
        Unit(1),
        BreakerConfig::default(),
        Hub::default(),
    );
    (device, controller)
}

#[tokio::test]
async fn discovery_stops_at_first_missing_stack() {
    let (device, controller) = inverter();
    device.set_input(200, SERIAL.0, &ascii("S2301234567", 10));
    device.set_input(200, FIRMWARE.0, &ascii("SBR_V1.2", 10));
    device.set_input(200, MODULE_SERIAL_BASE, &ascii("MOD-A", 9));
    device.set_input(200, MODULE_SERIAL_BASE + 9, &ascii("MOD-B", 9));
    device.set_input(201, SERIAL.0, &ascii("S2307654321", 10));
    device.set_absent(Unit(202));
    // would be found if probing went on past the gap
    device.set_input(203, SERIAL.0, &ascii("S2300000003", 10));

    let stacks = discover(&controller, DiscoveryOptions::default()).await;
    assert_eq!(stacks.len(), 2);

    assert_eq!(stacks[0].slave, 200);
    assert_eq!(stacks[0].serial_number, "S2301234567");
    assert_eq!(stacks[0].firmware_version, "SBR_V1.2");
    assert_eq!(
        stacks[0].modules,
        vec![
            BatteryModule { index: 0, serial_number: "MOD-A".into() },
            BatteryModule { index: 1, serial_number: "MOD-B".into() },
        ]
    );
    assert_eq!(stacks[1].slave, 201);
    assert!(stacks[1].modules.is_empty());
}

#[tokio::test]
async fn discovery_can_skip_gaps() {
    let (device, controller) = inverter();
    device.set_absent(Unit(201));
    device.set_absent(Unit(202));

    let options = DiscoveryOptions {
        stop_at_first_gap: false,
        ..Default::default()
    };
    let stacks = discover(&controller, options).await;
    let slaves: Vec<_> = stacks.iter().map(|s| s.slave).collect();
    assert_eq!(slaves, vec![200, 203]);
}

#[tokio::test]
async fn no_stacks_when_nothing_answers() {
    let (device, controller) = inverter();
    device.set_absent(Unit(200));
    assert!(discover(&controller, DiscoveryOptions::default()).await.is_empty());
    // the inverter's own link survives failed probes
    assert!(controller.connected());
}

#[tokio::test]
async fn status_block_is_decoded() {
    let (device, controller) = inverter();
    let mut block = [0u16; 20];
    block[0] = 5123; // 512.3 V
    block[1] = (-125i16) as u16; // -12.5 A
    block[2] = 251;
    block[3] = 876;
    block[4] = 98;
    block[5] = 0x0001;
    block[6] = 0x0000; // 6553.6 kWh
    block[7] = 0;
    block[8] = 1234;
    block[16] = 33512;
    block[17] = 7;
    block[18] = 33001;
    block[19] = 42;
    device.set_input(200, STATUS.0, &block);

    let mut stack = BatteryStack::new(0);
    assert!(stack.poll(&controller).await);
    let status = stack.status.unwrap();
    assert_eq!(status.voltage, Decimal::new(5123, 1));
    assert_eq!(status.current, Decimal::new(-125, 1));
    assert_eq!(status.temperature, Decimal::new(251, 1));
    assert_eq!(status.soc, Decimal::new(876, 1));
    assert_eq!(status.soh, Decimal::from(98));
    assert_eq!(status.total_charge_energy, Decimal::new(65536, 1));
    assert_eq!(status.total_discharge_energy, Decimal::new(1234, 1));
    assert_eq!(status.cell_voltage_max, Decimal::new(33512, 4));
    assert_eq!(status.cell_voltage_max_position, 7);
    assert_eq!(status.cell_voltage_min, Decimal::new(33001, 4));
    assert_eq!(status.cell_voltage_min_position, 42);
}

#[tokio::test]
async fn silent_stacks_leave_the_inverter_link_alone() {
    let (device, controller) = inverter();
    assert!(controller.connect().await);
    device.set_silent(Unit(200));

    assert!(discover(&controller, DiscoveryOptions::default()).await.is_empty());
    assert!(controller.connected());
    assert_eq!(device.opens(), 1);
    assert!(controller.read_input_registers(5000, 1).await.is_some());
}
