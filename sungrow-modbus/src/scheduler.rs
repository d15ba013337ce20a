use itertools::Itertools;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{select, task::JoinSet, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    battery::{self, BatteryStack, DiscoveryOptions},
    event::Event,
    modbus::{
        controller::DeviceController,
        register::{PollSpeed, RegisterGroup},
    },
    shutdown::Shutdown,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct PollIntervals {
    #[serde(with = "humantime_serde", default = "default_fast")]
    pub fast: Duration,
    #[serde(with = "humantime_serde", default = "default_normal")]
    pub normal: Duration,
    #[serde(with = "humantime_serde", default = "default_slow")]
    pub slow: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            fast: default_fast(),
            normal: default_normal(),
            slow: default_slow(),
        }
    }
}

fn default_fast() -> Duration {
    Duration::from_secs(5)
}

fn default_normal() -> Duration {
    Duration::from_secs(15)
}

fn default_slow() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SpikeFilterConfig {
    #[serde(default = "default_spike_registers")]
    pub registers: Vec<u16>,
    #[serde(default)]
    pub sentinel: u16,
    #[serde(default = "default_spike_threshold")]
    pub threshold: u32,
}

impl Default for SpikeFilterConfig {
    fn default() -> Self {
        Self {
            registers: default_spike_registers(),
            sentinel: 0,
            threshold: default_spike_threshold(),
        }
    }
}

fn default_spike_registers() -> Vec<u16> {
    // Shared with the meter on the inverter's busy RS485 bus, occasionally reads back 0.
    vec![33139]
}

fn default_spike_threshold() -> u32 {
    3
}

#[derive(Debug)]
struct SpikeState {
    last: u16,
    repeats: u32,
}

/// Holds back a sudden drop to the sentinel value on noisy registers until it has been read
/// `threshold` times in a row.
#[derive(Debug)]
pub struct SpikeFilter {
    config: SpikeFilterConfig,
    registers: HashSet<u16>,
    state: HashMap<u16, SpikeState>,
}

impl SpikeFilter {
    pub fn new(config: SpikeFilterConfig) -> Self {
        Self {
            registers: config.registers.iter().copied().collect(),
            config,
            state: HashMap::new(),
        }
    }

    /// The value to use for `register` given a freshly read `raw` word.
    pub fn filter(&mut self, register: u16, raw: u16) -> u16 {
        if !self.registers.contains(&register) {
            return raw;
        }

        let sentinel = self.config.sentinel;
        let Some(state) = self.state.get_mut(&register) else {
            self.state.insert(register, SpikeState { last: raw, repeats: 0 });
            return raw;
        };

        if raw == sentinel && state.last != sentinel {
            state.repeats += 1;
            if state.repeats < self.config.threshold {
                debug!(register, previous = state.last, repeats = state.repeats, "Suppressed spike");
                return state.last;
            }
        }

        state.last = raw;
        state.repeats = 0;
        raw
    }
}

/// What a single tick of [`Poller::poll`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Disabled,
    Disconnected,
    /// The same set of groups is still being polled by an earlier tick
    Duplicate,
    Completed { polled: usize },
}

/// Released when the poll that claimed it finishes, however it finishes.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Vec<u16>>>,
    key: Vec<u16>,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<Vec<u16>>>, key: Vec<u16>) -> Option<Self> {
        if !lock(set).insert(key.clone()) {
            return None;
        }
        Some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls one device's register groups at their cadences, decodes them and emits the values.
pub struct Poller {
    controller: Arc<DeviceController>,
    intervals: PollIntervals,
    groups: Mutex<Vec<Arc<RegisterGroup>>>,
    in_flight: Mutex<HashSet<Vec<u16>>>,
    spikes: Mutex<SpikeFilter>,
    batteries: tokio::sync::Mutex<Vec<BatteryStack>>,
}

impl Poller {
    pub fn new(
        controller: Arc<DeviceController>,
        groups: Vec<RegisterGroup>,
        intervals: PollIntervals,
        spikes: SpikeFilterConfig,
    ) -> Self {
        Self {
            controller,
            intervals,
            groups: Mutex::new(groups.into_iter().map(Arc::new).collect()),
            in_flight: Mutex::new(HashSet::new()),
            spikes: Mutex::new(SpikeFilter::new(spikes)),
            batteries: tokio::sync::Mutex::new(vec![]),
        }
    }

    pub fn controller(&self) -> &Arc<DeviceController> {
        &self.controller
    }

    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Groups due on a `tier` tick. "Once" groups ride along with the normal tier until they have
    /// been read.
    fn due(&self, tier: PollSpeed) -> Vec<Arc<RegisterGroup>> {
        lock(&self.groups)
            .iter()
            .filter(|group| match group.speed() {
                PollSpeed::Once => tier == PollSpeed::Normal,
                speed => speed == tier,
            })
            .cloned()
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self), fields(device = %self.controller.name()))]
    pub async fn poll(&self, tier: PollSpeed) -> PollOutcome {
        let controller = &self.controller;
        if !controller.is_enabled() {
            return PollOutcome::Disabled;
        }

        let connected = controller.connect().await;
        controller.hub().emit(Event::Status {
            device: controller.name().to_owned(),
            state: controller.connect_state(),
        });
        if !connected {
            return PollOutcome::Disconnected;
        }

        let groups = self.due(tier);
        let mut polled = 0;

        if !groups.is_empty() {
            let key: Vec<u16> = groups.iter().map(|group| group.start()).sorted().dedup().collect();
            let Some(_in_flight) = InFlight::claim(&self.in_flight, key) else {
                debug!("Previous poll of these groups still running");
                return PollOutcome::Duplicate;
            };

            for group in groups {
                if !self.poll_group(&group).await {
                    continue;
                }
                polled += 1;
                if group.speed() == PollSpeed::Once {
                    lock(&self.groups).retain(|g| !Arc::ptr_eq(g, &group));
                    debug!(start = group.start(), "Read once, dropping group");
                }
            }
        }

        if tier == PollSpeed::Slow {
            self.poll_batteries().await;
        }

        PollOutcome::Completed { polled }
    }

    async fn poll_group(&self, group: &RegisterGroup) -> bool {
        let controller = &self.controller;
        let cache = controller.hub().cache();
        let key = controller.device_key();
        let (start, count) = (group.start(), group.count());

        let words = match cache.get_range(key, start, count) {
            Some(words) => words,
            None => {
                let Some(mut words) = controller.read(group.kind(), start, count).await else {
                    return false;
                };
                {
                    let mut spikes = lock(&self.spikes);
                    for (offset, word) in words.iter_mut().enumerate() {
                        *word = spikes.filter(start.wrapping_add(offset as u16), *word);
                    }
                }
                if let Some(ttl) = group.cache_ttl() {
                    cache.set_range(key, start, &words, ttl);
                }
                words
            }
        };

        for field in group.fields() {
            let Some(value) = group
                .words_for(field, &words)
                .and_then(|words| field.decode(words))
            else {
                continue;
            };
            controller.hub().emit(Event::Value {
                device: controller.name().to_owned(),
                connection: controller.connection_id().to_owned(),
                slave: controller.slave().0,
                name: field.name.clone(),
                register: field.address,
                value,
                unit: field.unit.clone(),
            });
        }
        true
    }

    /// Probes for battery stacks and remembers them for slow-tier polling.
    pub async fn discover_batteries(&self, options: DiscoveryOptions) -> usize {
        let mut batteries = self.batteries.lock().await;
        *batteries = battery::discover(&self.controller, options).await;
        batteries.len()
    }

    async fn poll_batteries(&self) {
        // Discovery still running
        let Ok(mut stacks) = self.batteries.try_lock() else {
            return;
        };
        for stack in stacks.iter_mut() {
            if stack.poll(&self.controller).await {
                self.controller.hub().emit(Event::Battery {
                    device: self.controller.name().to_owned(),
                    stack: stack.clone(),
                });
            }
        }
    }

    /// Ticks every tier until `shutdown` fires. Each tick polls in its own task so a slow tier
    /// never delays a fast one.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let ticker = |period: Duration| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        };
        let mut fast = ticker(self.intervals.fast);
        let mut normal = ticker(self.intervals.normal);
        let mut slow = ticker(self.intervals.slow);
        let mut polls = JoinSet::new();

        info!(device = %self.controller.name(), intervals = ?self.intervals, "Polling started");
        loop {
            let tier = select! {
                _ = fast.tick() => PollSpeed::Fast,
                _ = normal.tick() => PollSpeed::Normal,
                _ = slow.tick() => PollSpeed::Slow,
                Some(finished) = polls.join_next() => {
                    if let Err(error) = finished {
                        error!(device = %self.controller.name(), %error, "Poll task failed");
                    }
                    continue;
                }
                _ = shutdown.recv() => break,
            };

            let poller = Arc::clone(&self);
            polls.spawn(async move { poller.poll(tier).await });
        }

        polls.shutdown().await;
        info!(device = %self.controller.name(), "Polling stopped");
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use crate::modbus::{
    breaker::BreakerConfig,
    codec::Value,
    mock::MockDevice,
    register::{Field, RegisterKind},
    Unit,
};

#[cfg(test)]
fn poller(device: &MockDevice, groups: Vec<RegisterGroup>) -> (crate::hub::Hub, Arc<Poller>) {
    let hub = crate::hub::Hub::default();
    let controller = DeviceController::new(
        "inverter",
        Arc::new(device.clone()),
        Unit(1),
        BreakerConfig::default(),
        hub.clone(),
    );
    let poller = Poller::new(
        Arc::new(controller),
        groups,
        PollIntervals::default(),
        SpikeFilterConfig::default(),
    );
    (hub, Arc::new(poller))
}

#[cfg(test)]
fn group(start: u16, count: u16, speed: PollSpeed, fields: Vec<Field>) -> RegisterGroup {
    RegisterGroup::new(start, count, speed, RegisterKind::Input, None, fields).unwrap()
}

#[cfg(test)]
fn values(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<(String, Value)> {
    let mut values = vec![];
    while let Ok(event) = events.try_recv() {
        if let Event::Value { name, value, .. } = event {
            values.push((name, value));
        }
    }
    values
}

#[test]
fn spike_filter_needs_repeats() {
    let mut filter = SpikeFilter::new(SpikeFilterConfig::default());
    assert_eq!(filter.filter(33139, 50), 50);
    assert_eq!(filter.filter(33139, 0), 50);
    assert_eq!(filter.filter(33139, 0), 50);
    assert_eq!(filter.filter(33139, 0), 0);
    assert_eq!(filter.filter(33139, 0), 0);

    // a recovery is taken immediately and resets the count
    assert_eq!(filter.filter(33139, 40), 40);
    assert_eq!(filter.filter(33139, 0), 40);
    assert_eq!(filter.filter(33139, 41), 41);
    assert_eq!(filter.filter(33139, 0), 41);

    assert_eq!(filter.filter(5000, 0), 0);
}

#[tokio::test]
async fn decodes_and_emits_group_values() {
    use rust_decimal::Decimal;

    let device = MockDevice::new("tcp:inverter:502");
    device.set_input(1, 5000, &[500, 10]);
    let tenth = Decimal::new(1, 1);
    let (hub, poller) = poller(
        &device,
        vec![group(
            5000,
            2,
            PollSpeed::Fast,
            vec![
                Field::numeric("a", 5000, 1, tenth, false),
                Field::numeric("b", 5001, 1, tenth, true),
            ],
        )],
    );
    let mut events = hub.subscribe();

    assert_eq!(poller.poll(PollSpeed::Fast).await, PollOutcome::Completed { polled: 1 });
    assert_eq!(
        values(&mut events),
        vec![
            ("a".to_owned(), Value::Number(Decimal::from(50))),
            ("b".to_owned(), Value::Number(Decimal::from(1))),
        ]
    );

    // nothing due on the other tiers
    assert_eq!(poller.poll(PollSpeed::Normal).await, PollOutcome::Completed { polled: 0 });
    assert_eq!(device.reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_polls_of_the_same_groups_are_skipped() {
    let device = MockDevice::new("tcp:inverter:502");
    device.set_read_delay(Duration::from_secs(1));
    let (_hub, poller) = poller(
        &device,
        vec![group(5000, 2, PollSpeed::Fast, vec![])],
    );

    let (first, second) = tokio::join!(poller.poll(PollSpeed::Fast), poller.poll(PollSpeed::Fast));
    assert_eq!(first, PollOutcome::Completed { polled: 1 });
    assert_eq!(second, PollOutcome::Duplicate);
    assert_eq!(device.reads(), 1);

    // released once finished
    assert_eq!(poller.poll(PollSpeed::Fast).await, PollOutcome::Completed { polled: 1 });
}

#[tokio::test]
async fn once_groups_are_dropped_after_first_read() {
    let device = MockDevice::new("tcp:inverter:502");
    device.set_input(1, 4990, &[0x4142, 0x4300]);
    let (hub, poller) = poller(
        &device,
        vec![
            group(4990, 2, PollSpeed::Once, vec![Field::string("serial", 4990, 2)]),
            group(5000, 1, PollSpeed::Normal, vec![]),
        ],
    );
    let mut events = hub.subscribe();

    assert_eq!(poller.poll(PollSpeed::Fast).await, PollOutcome::Completed { polled: 0 });
    assert_eq!(poller.group_count(), 2);

    assert_eq!(poller.poll(PollSpeed::Normal).await, PollOutcome::Completed { polled: 2 });
    assert_eq!(poller.group_count(), 1);
    assert_eq!(
        values(&mut events),
        vec![("serial".to_owned(), Value::Text("ABC".into()))]
    );
}

#[tokio::test]
async fn cached_groups_are_not_reread() {
    let device = MockDevice::new("tcp:inverter:502");
    let cached = RegisterGroup::new(
        13049,
        2,
        PollSpeed::Fast,
        RegisterKind::Holding,
        Some(Duration::from_secs(60)),
        vec![],
    )
    .unwrap();
    let (_hub, poller) = poller(&device, vec![cached]);

    poller.poll(PollSpeed::Fast).await;
    poller.poll(PollSpeed::Fast).await;
    assert_eq!(device.reads(), 1);
}

#[tokio::test]
async fn spikes_are_filtered_before_decoding() {
    use rust_decimal::Decimal;

    let device = MockDevice::new("tcp:inverter:502");
    device.set_input(1, 33139, &[50]);
    let (hub, poller) = poller(
        &device,
        vec![group(
            33139,
            1,
            PollSpeed::Fast,
            vec![Field::numeric("meter", 33139, 1, Decimal::ONE, false)],
        )],
    );
    let mut events = hub.subscribe();

    poller.poll(PollSpeed::Fast).await;
    device.set_input(1, 33139, &[0]);
    for _ in 0..3 {
        poller.poll(PollSpeed::Fast).await;
    }

    let readings: Vec<_> = values(&mut events).into_iter().map(|(_, v)| v).collect();
    let expected: Vec<_> = [50, 50, 50, 0]
        .into_iter()
        .map(|n| Value::Number(Decimal::from(n)))
        .collect();
    assert_eq!(readings, expected);
}

#[tokio::test]
async fn disabled_and_unreachable_devices_are_skipped() {
    let device = MockDevice::new("tcp:inverter:502");
    let (hub, poller) = poller(&device, vec![group(5000, 1, PollSpeed::Fast, vec![])]);
    let mut events = hub.subscribe();

    poller.controller().disable();
    assert_eq!(poller.poll(PollSpeed::Fast).await, PollOutcome::Disabled);
    poller.controller().enable();

    device.refuse_connections(true);
    assert_eq!(poller.poll(PollSpeed::Fast).await, PollOutcome::Disconnected);
    assert!(matches!(
        events.try_recv(),
        Ok(Event::Status { state: crate::event::ConnectState::Disconnected, .. })
    ));
    assert_eq!(device.reads(), 0);
}

#[tokio::test]
async fn slow_ticks_poll_discovered_batteries() {
    let device = MockDevice::new("tcp:inverter:502");
    device.set_absent(Unit(201));
    let (hub, poller) = poller(&device, vec![]);
    assert_eq!(poller.discover_batteries(DiscoveryOptions::default()).await, 1);

    let mut events = hub.subscribe();
    poller.poll(PollSpeed::Slow).await;

    let mut batteries = 0;
    while let Ok(event) = events.try_recv() {
        if let Event::Battery { stack, .. } = event {
            assert_eq!(stack.slave, 200);
            assert!(stack.status.is_some());
            batteries += 1;
        }
    }
    assert_eq!(batteries, 1);
}

#[tokio::test(start_paused = true)]
async fn run_ticks_until_shutdown() {
    let device = MockDevice::new("tcp:inverter:502");
    let (_hub, poller) = poller(&device, vec![group(5000, 1, PollSpeed::Fast, vec![])]);
    let trigger = crate::shutdown::Trigger::new();
    let running = tokio::spawn(Arc::clone(&poller).run(trigger.subscribe()));

    // first tick fires immediately, then every 5s
    tokio::time::sleep(Duration::from_secs(11)).await;
    trigger.fire();
    running.await.unwrap();
    assert_eq!(device.reads(), 3);
}
