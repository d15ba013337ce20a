use rumqttc::{LastWill, MqttOptions, QoS};
use serde::Deserialize;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::{sync::broadcast::error::RecvError, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    config::{Config, DeviceConfig},
    event::Event,
    hub::Hub,
    modbus::{controller::DeviceController, write_queue::WriteCommand},
    mqtt,
    scheduler::{Poller, SpikeFilterConfig},
    shutdown::{Shutdown, Trigger},
};

/// Holding register ranges known to be safe to write on Sungrow hybrid inverters.
pub const SAFE_WRITE_RANGES: &[(u16, u16)] = &[
    (13049, 13100),
    (33046, 33150),
    (43003, 43010),
    (43013, 43020),
    (43074, 43090),
    (43110, 43120),
];

const STATUS_TOPIC: &str = "status";

pub fn is_safe_write(start: u16, count: usize) -> bool {
    let end = start as usize + count.saturating_sub(1);
    SAFE_WRITE_RANGES
        .iter()
        .any(|&(low, high)| start >= low && end <= high as usize)
}

pub async fn run<P: Into<String>>(
    config: Config,
    prefix: P,
    mut mqtt_options: MqttOptions,
    shutdown: impl Future,
) -> crate::Result<()> {
    let prefix = prefix.into();
    let trigger = Trigger::new();

    mqtt_options.set_last_will(LastWill::new(
        format!("{prefix}/{STATUS_TOPIC}"),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    let mut mqtt_connection = mqtt::new(mqtt_options, trigger.subscribe());
    let mqtt = mqtt_connection.prefixed_handle(prefix)?;

    let hub = Hub::default();
    let mut tasks = JoinSet::new();
    let controllers = start_devices(config, &hub, &trigger, &mut tasks);

    tasks.spawn(publish_events(hub.subscribe(), mqtt.clone(), trigger.subscribe()));
    let commands = mqtt.subscribe("+/write/+").await?;
    tasks.spawn(handle_commands(commands, controllers.clone(), trigger.subscribe()));

    mqtt.publish(STATUS_TOPIC, "online", true).await?;

    let mut ret = Ok(());

    tokio::select! {
        res = mqtt_connection.run() => {
            if let Err(err) = res {
                error!(cause = %err, "server error");
                ret = Err(err)
            } else {
                info!("server finished running")
            }
        }

        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Write queues drain here before their controllers let go of the connections.
    trigger.fire();
    while let Some(result) = tasks.join_next().await {
        if let Err(error) = result {
            error!(%error, "Task failed during shutdown");
        }
    }
    for controller in controllers.values() {
        controller.close().await;
    }

    ret
}

/// Builds a controller and poller per configured device and spawns their long-running tasks.
fn start_devices(
    config: Config,
    hub: &Hub,
    trigger: &Trigger,
    tasks: &mut JoinSet<()>,
) -> Arc<HashMap<String, Arc<DeviceController>>> {
    let Config {
        devices,
        spike_filter,
    } = config;

    let mut controllers = HashMap::new();
    for device in devices {
        let controller = start_device(device, hub, &spike_filter, trigger, tasks);
        if let Some(previous) = controllers.insert(controller.name().to_owned(), controller) {
            warn!(device = %previous.name(), "Duplicate device name, commands reach the last one");
        }
    }
    Arc::new(controllers)
}

fn start_device(
    device: DeviceConfig,
    hub: &Hub,
    spike_filter: &SpikeFilterConfig,
    trigger: &Trigger,
    tasks: &mut JoinSet<()>,
) -> Arc<DeviceController> {
    let DeviceConfig {
        name,
        connection,
        unit,
        poll,
        circuit_breaker,
        multi_battery,
        battery_discovery,
        groups,
    } = device;

    let discover = multi_battery && connection.is_tcp();
    if multi_battery && !discover {
        warn!(device = %name, "Battery stacks are only reachable over TCP, skipping discovery");
    }

    let controller = Arc::new(DeviceController::new(
        name,
        Arc::new(connection),
        unit,
        circuit_breaker,
        hub.clone(),
    ));
    let poller = Arc::new(Poller::new(
        controller.clone(),
        groups,
        poll,
        spike_filter.clone(),
    ));
    info!(
        device = %controller.name(),
        key = %controller.device_key(),
        groups = poller.group_count(),
        "Starting device"
    );

    let writes = controller.spawn_write_queue(trigger.subscribe());
    tasks.spawn(async move {
        if let Err(error) = writes.await {
            error!(%error, "Write queue task failed");
        }
    });

    if discover {
        let poller = poller.clone();
        let mut shutdown = trigger.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                stacks = poller.discover_batteries(battery_discovery) => {
                    info!(device = %poller.controller().name(), stacks, "Battery discovery finished");
                }
                _ = shutdown.recv() => {}
            }
        });
    }

    tasks.spawn(poller.run(trigger.subscribe()));
    controller
}

/// Relays engine events to MQTT.
async fn publish_events(
    mut events: tokio::sync::broadcast::Receiver<Event>,
    mqtt: mqtt::Handle,
    mut shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.recv() => return,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event publisher fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let (topic, retain) = match event {
            Event::Value { ref device, register, .. } => (format!("{device}/{register}"), false),
            Event::Status { ref device, .. } => (format!("{device}/status"), true),
            Event::Battery { ref device, ref stack } => {
                (format!("{device}/battery/{}", stack.index), false)
            }
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, ?event, "Could not serialise event");
                continue;
            }
        };
        if let Err(error) = mqtt.publish(topic, payload, retain).await {
            warn!(%error, "Dropping events, MQTT connection is gone");
            return;
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WritePayload {
    Single(i64),
    Multiple(Vec<i64>),
}

/// Turns a `{device}/write/{register}` command into a write, validating address and values.
pub fn parse_write(register: &str, payload: &[u8]) -> crate::Result<WriteCommand> {
    let word = |n: i64| {
        u16::try_from(n).map_err(|_| crate::Error::from(format!("{n} is not a register value (0-65535)")))
    };

    let register = register
        .parse::<i64>()
        .map_err(|_| crate::Error::from(format!("{register} is not a register address")))?;
    let register = u16::try_from(register)
        .map_err(|_| crate::Error::from(format!("{register} is outside 0-65535")))?;

    let command = match serde_json::from_slice::<WritePayload>(payload)? {
        WritePayload::Single(value) => WriteCommand::Single {
            register,
            value: word(value)?,
        },
        WritePayload::Multiple(values) if values.is_empty() => {
            return Err("No values to write".into());
        }
        WritePayload::Multiple(values) => WriteCommand::Multiple {
            start: register,
            values: values.into_iter().map(word).collect::<crate::Result<_>>()?,
        },
    };

    if register as usize + command.values().len() > u16::MAX as usize + 1 {
        return Err("Write runs past the last register".into());
    }
    Ok(command)
}

async fn handle_commands(
    mut commands: tokio::sync::mpsc::Receiver<mqtt::Payload>,
    controllers: Arc<HashMap<String, Arc<DeviceController>>>,
    mut shutdown: Shutdown,
) {
    loop {
        let mqtt::Payload { topic, bytes } = tokio::select! {
            payload = commands.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
            _ = shutdown.recv() => return,
        };

        // `{prefix}/{device}/write/{register}`
        let mut segments = topic.rsplit('/');
        let (Some(register), Some("write"), Some(device)) =
            (segments.next(), segments.next(), segments.next())
        else {
            warn!(%topic, "Malformed write topic");
            continue;
        };

        let Some(controller) = controllers.get(device) else {
            warn!(%device, "Write for unknown device");
            continue;
        };

        let command = match parse_write(register, &bytes) {
            Ok(command) => command,
            Err(error) => {
                warn!(%device, %register, %error, "Rejected write");
                continue;
            }
        };

        if !is_safe_write(command.start(), command.values().len()) {
            warn!(%device, ?command, "Writing outside the known safe holding registers");
        }

        // Queued here, in arrival order. Only the wait for the outcome moves to its own task so one
        // slow device never holds up commands for another.
        let completion = match controller.write_queue().enqueue(command.clone()) {
            Ok(completion) => completion,
            Err(error) => {
                warn!(%device, ?command, %error, "Write rejected");
                continue;
            }
        };
        let device = device.to_owned();
        tokio::spawn(async move {
            match completion.await.ok().flatten() {
                Some(ack) => info!(%device, ?command, ?ack, "Write completed"),
                None => warn!(%device, ?command, "Write not confirmed"),
            }
        });
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_write_commands() {
    assert_eq!(
        parse_write("13049", b"2").unwrap(),
        WriteCommand::Single { register: 13049, value: 2 }
    );
    assert_eq!(
        parse_write("13051", b"[100, 65535]").unwrap(),
        WriteCommand::Multiple { start: 13051, values: vec![100, 65535] }
    );
}

#[test]
fn reject_invalid_write_commands() {
    assert!(parse_write("65536", b"1").is_err());
    assert!(parse_write("-1", b"1").is_err());
    assert!(parse_write("soc", b"1").is_err());
    assert!(parse_write("13049", b"65536").is_err());
    assert!(parse_write("13049", b"-1").is_err());
    assert!(parse_write("13049", b"[]").is_err());
    assert!(parse_write("13049", b"\"on\"").is_err());
    assert!(parse_write("65535", b"[1, 2]").is_err());
    assert!(parse_write("65535", b"[1]").is_ok());
}

#[test]
fn safe_write_ranges() {
    assert!(is_safe_write(13049, 1));
    assert!(is_safe_write(13099, 2));
    assert!(!is_safe_write(13100, 2));
    assert!(is_safe_write(43110, 11));
    assert!(!is_safe_write(5000, 1));
    assert!(!is_safe_write(43011, 1));
}

#[tokio::test]
async fn commands_are_routed_to_the_write_queue() {
    use crate::modbus::{breaker::BreakerConfig, mock::MockDevice, Unit};

    let device = MockDevice::new("tcp:inverter:502");
    let controller = Arc::new(DeviceController::new(
        "inverter",
        Arc::new(device.clone()),
        Unit(1),
        BreakerConfig::default(),
        Hub::default(),
    ));
    assert!(controller.connect().await);

    let trigger = Trigger::new();
    let writes = controller.spawn_write_queue(trigger.subscribe());
    let controllers = Arc::new(HashMap::from([("inverter".to_owned(), controller.clone())]));
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let handler = tokio::spawn(handle_commands(rx, controllers, trigger.subscribe()));

    for (topic, bytes) in [
        ("sungrow/inverter/write/13049", "3"),
        ("sungrow/battery/write/13049", "4"),
        ("sungrow/inverter/write/13050", "70000"),
        ("sungrow/inverter/write/13051", "[5, 6]"),
    ] {
        tx.send(mqtt::Payload {
            topic: topic.to_owned(),
            bytes: bytes.into(),
        })
        .await
        .unwrap();
    }

    // Writes land asynchronously; wait for both valid ones.
    while device.writes().len() < 2 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        device.writes(),
        vec![(1, 13049, vec![3]), (1, 13051, vec![5, 6])]
    );

    trigger.fire();
    handler.await.unwrap();
    writes.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn commands_are_written_in_arrival_order() {
    use crate::modbus::{breaker::BreakerConfig, mock::MockDevice, Unit};

    let device = MockDevice::new("tcp:inverter:502");
    let controller = Arc::new(DeviceController::new(
        "inverter",
        Arc::new(device.clone()),
        Unit(1),
        BreakerConfig::default(),
        Hub::default(),
    ));
    assert!(controller.connect().await);

    let trigger = Trigger::new();
    let controllers = Arc::new(HashMap::from([("inverter".to_owned(), controller.clone())]));
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    for (register, value) in [("13049", "1"), ("13050", "2"), ("13051", "3")] {
        tx.send(mqtt::Payload {
            topic: format!("sungrow/inverter/write/{register}"),
            bytes: value.into(),
        })
        .await
        .unwrap();
    }
    drop(tx);

    // every command is queued before the consumer starts
    handle_commands(rx, controllers, trigger.subscribe()).await;
    let writes = controller.spawn_write_queue(trigger.subscribe());

    while device.writes().len() < 3 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        device.writes(),
        vec![(1, 13049, vec![1]), (1, 13050, vec![2]), (1, 13051, vec![3])]
    );

    trigger.fire();
    writes.await.unwrap();
}
