use serde::Deserialize;
use std::path::Path;

use crate::{
    battery::DiscoveryOptions,
    modbus::{
        breaker::BreakerConfig, connection::ModbusProto, register::RegisterGroup, Unit, UnitId,
    },
    scheduler::{PollIntervals, SpikeFilterConfig},
};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub spike_filter: SpikeFilterConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    pub connection: ModbusProto,

    #[serde(alias = "slave", default = "default_unit", with = "UnitDef")]
    pub unit: Unit,

    #[serde(default)]
    pub poll: PollIntervals,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Probe for battery stacks on slave ids 200+ (network connections only)
    #[serde(default)]
    pub multi_battery: bool,

    #[serde(default)]
    pub battery_discovery: DiscoveryOptions,

    #[serde(default)]
    pub groups: Vec<RegisterGroup>,
}

#[derive(Deserialize)]
#[serde(remote = "tokio_modbus::slave::Slave")]
struct UnitDef(UnitId);

fn default_unit() -> Unit {
    Unit(1)
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_minimal_device() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "devices": [{
            "name": "inverter",
            "connection": { "proto": "tcp", "host": "10.10.10.219" }
        }]
    }))
    .unwrap();

    let device = &config.devices[0];
    assert_eq!(device.unit, Unit(1));
    assert_eq!(device.poll, PollIntervals::default());
    assert_eq!(device.circuit_breaker, BreakerConfig::default());
    assert!(!device.multi_battery);
    assert!(device.groups.is_empty());
    assert_eq!(config.spike_filter, SpikeFilterConfig::default());
}

#[test]
fn parse_full_device() {
    use serde_json::json;
    use std::time::Duration;

    let config = serde_json::from_value::<Config>(json!({
        "spike_filter": { "registers": [33139, 33140], "threshold": 4 },
        "devices": [{
            "name": "inverter",
            "connection": { "proto": "tcp", "host": "10.10.10.219", "port": 5020 },
            "slave": 3,
            "poll": { "fast": "2s", "slow": "1m" },
            "circuit_breaker": { "failure_threshold": 3, "recovery_timeout": "2m" },
            "multi_battery": true,
            "battery_discovery": { "stop_at_first_gap": false },
            "groups": [
                {
                    "start": 5000,
                    "count": 2,
                    "speed": "fast",
                    "fields": [
                        { "name": "device_type", "address": 5000, "map": { "3599": "SH5.0RS" } },
                        { "name": "nominal_power", "address": 5001, "scale": 0.1, "unit": "kW" },
                    ]
                },
                {
                    "start": 13049,
                    "count": 1,
                    "register_type": "holding",
                    "cache_ttl": "30s",
                    "fields": [{ "name": "ems_mode", "address": 13049 }]
                }
            ]
        }]
    }))
    .unwrap();

    assert_eq!(config.spike_filter.registers, vec![33139, 33140]);
    assert_eq!(config.spike_filter.threshold, 4);
    assert_eq!(config.spike_filter.sentinel, 0);

    let device = &config.devices[0];
    assert!(matches!(device.connection, ModbusProto::Tcp { port: 5020, .. }));
    assert_eq!(device.unit, Unit(3));
    assert_eq!(device.poll.fast, Duration::from_secs(2));
    assert_eq!(device.poll.normal, Duration::from_secs(15));
    assert_eq!(device.poll.slow, Duration::from_secs(60));
    assert_eq!(device.circuit_breaker.failure_threshold, 3);
    assert_eq!(device.circuit_breaker.recovery_timeout, Duration::from_secs(120));
    assert!(device.multi_battery);
    assert!(!device.battery_discovery.stop_at_first_gap);
    assert_eq!(device.battery_discovery.max_stacks, 4);
    assert_eq!(device.groups.len(), 2);
    assert!(device.groups[1].is_holding());
}

#[test]
fn invalid_groups_are_rejected_at_load() {
    let result = serde_json::from_value::<Config>(serde_json::json!({
        "devices": [{
            "name": "inverter",
            "connection": { "proto": "tcp", "host": "10.10.10.219" },
            "groups": [{ "start": 5000, "count": 1, "fields": [{ "address": 5003 }] }]
        }]
    }));
    let error = result.unwrap_err().to_string();
    assert!(error.contains("outside group"), "{error}");
}
