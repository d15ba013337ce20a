//! Cooperative shutdown for the long-running loops (pollers, write queues, the MQTT bridge).

use tokio::sync::broadcast;

type Notify = broadcast::Receiver<()>;

/// Listens for the shutdown signal.
///
/// A single `()` is ever sent on the broadcast channel; dropping every sender has the same
/// effect. Loops `select!` on [`Shutdown::recv`] next to their real work and run their cleanup
/// (for example draining a write queue) before returning.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` once the signal has been observed
    shutdown: bool,

    notify: Notify,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Shutdown {
    pub fn new(notify: Notify) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent. A closed channel counts as
        // a shutdown too.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

impl From<Notify> for Shutdown {
    fn from(notify: Notify) -> Self {
        Self::new(notify)
    }
}

/// Owning side of a [`Shutdown`]; signals every subscriber when [`Trigger::fire`] is called or
/// the trigger is dropped.
#[derive(Debug)]
pub struct Trigger {
    notify: broadcast::Sender<()>,
}

impl Trigger {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self { notify }
    }

    pub fn subscribe(&self) -> Shutdown {
        self.notify.subscribe().into()
    }

    pub fn fire(&self) {
        let _ = self.notify.send(());
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

#[tokio::test]
async fn recv_returns_once_fired() {
    let trigger = Trigger::new();
    let mut shutdown = trigger.subscribe();
    let mut clone = shutdown.clone();
    assert!(!shutdown.is_shutdown());

    trigger.fire();
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());

    clone.recv().await;
    assert!(clone.is_shutdown());
}

#[tokio::test]
async fn dropping_the_trigger_counts_as_shutdown() {
    let trigger = Trigger::new();
    let mut shutdown = trigger.subscribe();
    drop(trigger);
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());
}
