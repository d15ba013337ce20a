use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Mutex, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;

/// How long the consumer waits before re-checking a disconnected device.
pub const DISCONNECTED_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteCommand {
    Single { register: u16, value: u16 },
    Multiple { start: u16, values: Vec<u16> },
}

impl WriteCommand {
    pub fn start(&self) -> u16 {
        match *self {
            WriteCommand::Single { register, .. } => register,
            WriteCommand::Multiple { start, .. } => start,
        }
    }

    pub fn values(&self) -> &[u16] {
        match self {
            WriteCommand::Single { value, .. } => std::slice::from_ref(value),
            WriteCommand::Multiple { values, .. } => values,
        }
    }
}

/// Transport acknowledgement of a write: the echoed address and the echoed value (single) or
/// register count (multiple).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub address: u16,
    pub value: u16,
}

pub type Completion = oneshot::Receiver<Option<WriteAck>>;

#[derive(Debug)]
pub struct WriteRequest {
    pub command: WriteCommand,
    done: oneshot::Sender<Option<WriteAck>>,
}

/// Executes queued writes. Implemented by the device controller.
#[async_trait]
pub trait WriteExecutor: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn execute(&self, command: &WriteCommand) -> Option<WriteAck>;
}

/// FIFO of pending writes for one device, consumed by a single loop so that at most one write is
/// ever in flight and writes run in submission order.
#[derive(Debug)]
pub struct WriteQueue {
    label: String,
    tx: mpsc::UnboundedSender<WriteRequest>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<WriteRequest>>>,
}

impl WriteQueue {
    pub fn new<L: Into<String>>(label: L) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queues `command`, returning the handle its outcome is delivered on.
    pub fn enqueue(&self, command: WriteCommand) -> crate::Result<Completion> {
        let (done, completion) = oneshot::channel();
        debug!(device = %self.label, ?command, "Queueing write");
        self.tx
            .send(WriteRequest { command, done })
            .map_err(|_| crate::Error::QueueClosed)?;
        Ok(completion)
    }

    /// Queues `command` and waits for it to run. `None` when the write failed or was never run.
    pub async fn submit(&self, command: WriteCommand) -> Option<WriteAck> {
        match self.enqueue(command) {
            Ok(completion) => completion.await.ok().flatten(),
            Err(error) => {
                warn!(device = %self.label, %error, "Write rejected");
                None
            }
        }
    }

    /// Runs the consumer loop until `shutdown` fires, then executes whatever was already queued.
    ///
    /// Only one consumer can ever run; later calls return immediately.
    pub async fn consume<E: WriteExecutor + ?Sized>(&self, executor: &E, mut shutdown: Shutdown) {
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(device = %self.label, "Write queue consumer already running");
            return;
        };

        loop {
            if !executor.is_connected() {
                select! {
                    _ = sleep(DISCONNECTED_BACKOFF) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            select! {
                // Shutdown wins over a request that becomes ready at the same time; it is then
                // picked up by the drain below.
                biased;
                _ = shutdown.recv() => break,
                request = rx.recv() => match request {
                    Some(request) => Self::run(executor, request).await,
                    None => return,
                },
            }
        }

        rx.close();
        let mut drained = 0;
        while let Ok(request) = rx.try_recv() {
            Self::run(executor, request).await;
            drained += 1;
        }
        info!(device = %self.label, drained, "Write queue stopped");
    }

    async fn run<E: WriteExecutor + ?Sized>(executor: &E, request: WriteRequest) {
        let WriteRequest { command, done } = request;
        let outcome = executor.execute(&command).await;
        // The submitter may have stopped waiting.
        let _ = done.send(outcome);
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
#[derive(Default)]
struct Recorder {
    offline: std::sync::atomic::AtomicBool,
    executed: Mutex<Vec<WriteCommand>>,
}

#[cfg(test)]
#[async_trait]
impl WriteExecutor for Recorder {
    fn is_connected(&self) -> bool {
        !self.offline.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn execute(&self, command: &WriteCommand) -> Option<WriteAck> {
        tokio::task::yield_now().await;
        self.executed.lock().unwrap().push(command.clone());
        Some(WriteAck {
            address: command.start(),
            value: command.values()[0],
        })
    }
}

#[tokio::test]
async fn writes_run_in_submission_order() {
    use std::sync::Arc;

    let queue = Arc::new(WriteQueue::new("test"));
    let recorder = Arc::new(Recorder::default());
    let trigger = crate::shutdown::Trigger::new();

    let consumer = {
        let (queue, recorder, shutdown) = (queue.clone(), recorder.clone(), trigger.subscribe());
        tokio::spawn(async move { queue.consume(recorder.as_ref(), shutdown).await })
    };

    let first = queue
        .enqueue(WriteCommand::Single { register: 13049, value: 2 })
        .unwrap();
    let second = queue
        .enqueue(WriteCommand::Multiple { start: 13050, values: vec![1, 2] })
        .unwrap();

    assert_eq!(second.await.unwrap(), Some(WriteAck { address: 13050, value: 1 }));
    assert_eq!(first.await.unwrap(), Some(WriteAck { address: 13049, value: 2 }));
    assert_eq!(
        recorder.executed.lock().unwrap().clone(),
        vec![
            WriteCommand::Single { register: 13049, value: 2 },
            WriteCommand::Multiple { start: 13050, values: vec![1, 2] },
        ]
    );

    trigger.fire();
    consumer.await.unwrap();
}

#[tokio::test]
async fn queued_writes_are_drained_on_shutdown() {
    let queue = WriteQueue::new("test");
    let recorder = Recorder::default();
    let trigger = crate::shutdown::Trigger::new();
    let shutdown = trigger.subscribe();

    let pending: Vec<_> = (0..3)
        .map(|value| {
            queue
                .enqueue(WriteCommand::Single { register: 13051, value })
                .unwrap()
        })
        .collect();

    trigger.fire();
    queue.consume(&recorder, shutdown).await;

    for (value, completion) in pending.into_iter().enumerate() {
        assert_eq!(
            completion.await.unwrap(),
            Some(WriteAck { address: 13051, value: value as u16 })
        );
    }
    assert_eq!(recorder.executed.lock().unwrap().len(), 3);

    // consumer is gone, nothing will run new writes
    assert!(matches!(
        queue.enqueue(WriteCommand::Single { register: 1, value: 1 }),
        Err(crate::Error::QueueClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn waits_while_disconnected() {
    use std::sync::{atomic::Ordering, Arc};

    let queue = Arc::new(WriteQueue::new("test"));
    let recorder = Arc::new(Recorder::default());
    recorder.offline.store(true, Ordering::SeqCst);
    let trigger = crate::shutdown::Trigger::new();

    let consumer = {
        let (queue, recorder, shutdown) = (queue.clone(), recorder.clone(), trigger.subscribe());
        tokio::spawn(async move { queue.consume(recorder.as_ref(), shutdown).await })
    };

    let mut completion = queue
        .enqueue(WriteCommand::Single { register: 13049, value: 0 })
        .unwrap();
    tokio::time::sleep(DISCONNECTED_BACKOFF * 2).await;
    assert!(completion.try_recv().is_err());
    assert!(recorder.executed.lock().unwrap().is_empty());

    recorder.offline.store(false, Ordering::SeqCst);
    assert_eq!(
        completion.await.unwrap(),
        Some(WriteAck { address: 13049, value: 0 })
    );

    trigger.fire();
    consumer.await.unwrap();
}
