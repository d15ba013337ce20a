use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{cache::RegisterCache, event::Event, modbus::pool::ConnectionPool};

/// Shared state of one running engine: the connection pool, the register cache and the event
/// stream. Cheap to clone; every controller and poller holds one.
#[derive(Clone)]
pub struct Hub {
    pool: Arc<ConnectionPool>,
    cache: Arc<RegisterCache>,
    events: broadcast::Sender<Event>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Hub {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            pool: Arc::new(ConnectionPool::new()),
            cache: Arc::new(RegisterCache::new()),
            events,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<RegisterCache> {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Delivers `event` to current subscribers, if any.
    pub fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!("Event dropped, nobody is listening");
        }
    }
}
