use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use rumqttc::{
    mqttbytes::matches as matches_topic, mqttbytes::valid_topic, AsyncClient, Event, EventLoop,
    MqttOptions, Publish, QoS, Subscribe, SubscribeFilter,
};
use tokio::{
    select,
    sync::mpsc::{channel, Receiver, Sender},
    time::sleep,
};
use tracing::{debug, warn};

use crate::shutdown::Shutdown;

/// Pause before polling the event loop again after a connection error; rumqttc reconnects on the
/// next poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct Payload {
    pub topic: String,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub enum Message {
    Subscribe(Subscribe, Sender<Payload>),
    Publish(Publish),
}

pub(crate) fn new(options: MqttOptions, shutdown: Shutdown) -> Connection {
    let (client, event_loop) = AsyncClient::new(options, 32);

    let (tx, rx) = channel(32);
    Connection {
        client,
        event_loop,
        subscriptions: HashMap::new(),
        tx,
        rx,
        shutdown,
    }
}

// Maintain internal subscriptions as well as MQTT subscriptions. Relay all received messages on MQTT subscribed topics
// to internal components who have a matching topic.
pub(crate) struct Connection {
    subscriptions: HashMap<String, Vec<Sender<Payload>>>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    client: AsyncClient,
    event_loop: EventLoop,
    shutdown: Shutdown,
}

impl Connection {
    pub async fn run(&mut self) -> crate::Result<()> {
        loop {
            select! {
                event = self.event_loop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(event).await?,
                        Err(error) => {
                            warn!(%error, "MQTT connection error");
                            sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                request = self.rx.recv() => {
                    match request {
                        None => return Ok(()),
                        Some(req) => self.handle_request(req).await?,
                    }
                }
                _ = self.shutdown.recv() => return Ok(())
            }
        }
    }

    /// Create a handle for interacting with the MQTT server such that a pre-provided prefix is transparently added to
    /// all relevant commands which use a topic.
    pub fn prefixed_handle<S: Into<String>>(&self, prefix: S) -> crate::Result<Handle> {
        let prefix = prefix.into();

        if !valid_topic(&prefix) {
            return Err("Prefix is not a valid topic".into());
        }

        Ok(Handle {
            prefix,
            tx: self.tx.clone(),
        })
    }

    async fn handle_event(&mut self, event: Event) -> crate::Result<()> {
        use rumqttc::Incoming;

        #[allow(clippy::single_match)]
        match event {
            Event::Incoming(Incoming::Publish(Publish { topic, payload, .. })) => {
                debug!(%topic, ?payload, "publish");
                self.handle_data(topic, payload).await;
            }
            _ => {}
        }

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, bytes), fields(subscriptions = ?self.subscriptions.keys()))]
    async fn handle_data(&mut self, topic: String, bytes: Bytes) {
        let mut targets = vec![];

        // Remove subscriptions whose channels are closed, adding matching channels to the `targets` vec.
        self.subscriptions.retain(|filter, channels| {
            if matches_topic(&topic, filter) {
                channels.retain(|channel| {
                    if channel.is_closed() {
                        warn!(?channel, "closed");
                        false
                    } else {
                        targets.push(channel.clone());
                        true
                    }
                });
                !channels.is_empty()
            } else {
                true
            }
        });

        for target in targets {
            let payload = Payload {
                topic: topic.clone(),
                bytes: bytes.clone(),
            };
            // Closed channels are removed above the next time a matching payload arrives.
            let _ = target.send(payload).await;
        }
    }

    async fn handle_request(&mut self, request: Message) -> crate::Result<()> {
        match request {
            Message::Publish(Publish {
                topic,
                payload,
                qos,
                retain,
                ..
            }) => {
                self.client
                    .publish_bytes(topic, qos, retain, payload)
                    .await?
            }
            Message::Subscribe(Subscribe { filters, .. }, channel) => {
                for filter in &filters {
                    self.subscriptions
                        .entry(filter.path.clone())
                        .or_default()
                        .push(channel.clone());
                }

                self.client.subscribe_many(filters).await?
            }
        }
        Ok(())
    }
}

/// Cheap, cloneable access to the MQTT connection with every topic scoped under `prefix`.
#[derive(Clone, Debug)]
pub struct Handle {
    prefix: String,
    tx: Sender<Message>,
}

impl Handle {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn publish<T: AsRef<str>, P: Into<Bytes>>(
        &self,
        topic: T,
        payload: P,
        retain: bool,
    ) -> crate::Result<()> {
        let mut publish = Publish::from_bytes(topic.as_ref(), QoS::AtLeastOnce, payload.into());
        publish.retain = retain;
        self.send(Message::Publish(publish)).await
    }

    pub async fn subscribe<T: Into<String>>(&self, filter: T) -> crate::Result<Receiver<Payload>> {
        let (tx, rx) = channel(32);
        self.send(Message::Subscribe(
            Subscribe::new(filter, QoS::AtLeastOnce),
            tx,
        ))
        .await?;
        Ok(rx)
    }

    async fn send(&self, message: Message) -> crate::Result<()> {
        self.tx
            .send(message.prefixed(&self.prefix))
            .await
            .map_err(|_| crate::Error::Other("MQTT connection closed".into()))
    }
}

trait Prefixable {
    fn prefixed(self, prefix: &str) -> Self;
}

impl Prefixable for Message {
    fn prefixed(self, prefix: &str) -> Self {
        match self {
            Message::Subscribe(sub, channel) => Message::Subscribe(sub.prefixed(prefix), channel),
            Message::Publish(publish) => Message::Publish(publish.prefixed(prefix)),
        }
    }
}

impl Prefixable for Subscribe {
    fn prefixed(self, prefix: &str) -> Self {
        Self {
            pkid: self.pkid,
            filters: self
                .filters
                .into_iter()
                .map(|f| f.prefixed(prefix))
                .collect(),
        }
    }
}

impl Prefixable for Publish {
    fn prefixed(mut self, prefix: &str) -> Self {
        self.topic = format!("{}/{}", prefix, &self.topic);
        self
    }
}

impl Prefixable for SubscribeFilter {
    fn prefixed(self, prefix: &str) -> Self {
        SubscribeFilter {
            path: format!("{}/{}", prefix, &self.path),
            qos: self.qos,
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn messages_are_prefixed() {
    let publish = Message::Publish(Publish::new("inverter/status", QoS::AtLeastOnce, "online"))
        .prefixed("sungrow");
    assert!(matches!(publish, Message::Publish(Publish { ref topic, .. }) if topic == "sungrow/inverter/status"));

    let (tx, _rx) = channel(1);
    let subscribe = Message::Subscribe(Subscribe::new("+/write/+", QoS::AtLeastOnce), tx)
        .prefixed("sungrow");
    match subscribe {
        Message::Subscribe(Subscribe { filters, .. }, _) => {
            assert_eq!(filters[0].path, "sungrow/+/write/+");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn incoming_publishes_reach_matching_subscribers() {
    let trigger = crate::shutdown::Trigger::new();
    let mut connection = new(MqttOptions::new("test", "localhost", 1883), trigger.subscribe());
    let (tx, mut rx) = channel(4);
    connection
        .subscriptions
        .insert("sungrow/+/write/+".to_owned(), vec![tx]);

    connection
        .handle_data("sungrow/inverter/write/13049".to_owned(), Bytes::from_static(b"2"))
        .await;
    connection
        .handle_data("sungrow/inverter/5000".to_owned(), Bytes::from_static(b"1"))
        .await;

    let payload = rx.recv().await.unwrap();
    assert_eq!(payload.topic, "sungrow/inverter/write/13049");
    assert_eq!(payload.bytes, Bytes::from_static(b"2"));
    assert!(rx.try_recv().is_err());
}
