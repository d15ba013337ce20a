use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::debug;

use super::connection::{Connection, Endpoint};

struct Entry {
    connection: Arc<Connection>,
    refs: usize,
}

/// Shares one [`Connection`] between every device controller addressing the same physical link.
///
/// Connections are reference counted; the last [`ConnectionPool::release`] closes the transport
/// and forgets it.
#[derive(Default)]
pub struct ConnectionPool {
    links: Mutex<HashMap<String, Entry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, endpoint: Arc<dyn Endpoint>) -> Arc<Connection> {
        let id = endpoint.id();
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let entry = links.entry(id.clone()).or_insert_with(|| {
            debug!(connection = %id, "New pooled connection");
            Entry {
                connection: Arc::new(Connection::new(endpoint)),
                refs: 0,
            }
        });
        entry.refs += 1;
        debug!(connection = %id, refs = entry.refs, "Acquired connection");
        Arc::clone(&entry.connection)
    }

    /// Drops one reference, closing the connection when it was the last. Unknown ids are ignored.
    pub async fn release(&self, id: &str) {
        let closing = {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            match links.get_mut(id) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    debug!(connection = %id, refs = entry.refs, "Released connection");
                    None
                }
                Some(_) => links.remove(id).map(|entry| entry.connection),
                None => None,
            }
        };

        if let Some(connection) = closing {
            debug!(connection = %id, "Last reference released");
            connection.close().await;
        }
    }

    pub fn ref_count(&self, id: &str) -> usize {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.get(id).map_or(0, |entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[tokio::test]
async fn shares_and_closes_connections() {
    use super::mock::MockDevice;

    let pool = ConnectionPool::new();
    let device = Arc::new(MockDevice::new("tcp:10.0.0.5:502"));

    let first = pool.acquire(device.clone());
    let second = pool.acquire(device.clone());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.ref_count("tcp:10.0.0.5:502"), 2);

    first.connect().await.unwrap();
    assert!(second.is_connected());

    pool.release("tcp:10.0.0.5:502").await;
    assert_eq!(pool.ref_count("tcp:10.0.0.5:502"), 1);
    assert!(second.is_connected());

    pool.release("tcp:10.0.0.5:502").await;
    assert_eq!(pool.ref_count("tcp:10.0.0.5:502"), 0);
    assert!(pool.is_empty());
    assert!(!second.is_connected());

    // releasing more than acquired is harmless
    pool.release("tcp:10.0.0.5:502").await;
    assert_eq!(device.opens(), 1);
}

#[test]
fn distinct_links_get_distinct_connections() {
    use super::mock::MockDevice;

    let pool = ConnectionPool::new();
    let a = pool.acquire(Arc::new(MockDevice::new("tcp:10.0.0.5:502")));
    let b = pool.acquire(Arc::new(MockDevice::new("rtu:/dev/ttyUSB0")));
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(pool.len(), 2);
}
