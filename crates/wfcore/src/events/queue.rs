use crate::BusError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

/// Queue carrying tasks from the engine to workers
pub const TASK_QUEUE: &str = "task_queue";
/// Queue carrying completion notifications from workers to the engine
pub const TASK_COMPLETION_QUEUE: &str = "task_completion_queue";

/// One message handed to a consumer; it stays claimed until acked or nacked
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// At-least-once work queue transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a persistent message; returns once the bus has accepted it
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Join the competing consumers of `queue`
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError>;
}

/// Consumer side of a queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the bus shut down.
    async fn next(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Settle a delivery; it will not be seen again
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Return a delivery to the queue for redelivery
    async fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

#[derive(Debug, Clone)]
struct Envelope {
    tag: u64,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    closed: bool,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned queue only means a panicking consumer; the data is intact
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_back(&self, envelope: Envelope) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.ready.push_back(envelope);
        }
        self.notify.notify_waiters();
        true
    }

    fn requeue(&self, mut envelope: Envelope) {
        envelope.redelivered = true;
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.ready.push_front(envelope);
        }
        self.notify.notify_waiters();
    }
}

/// In-process message bus with work-queue semantics
///
/// Each queue is shared by its subscribers; a message goes to exactly one of
/// them and is redelivered if nacked or if the claiming subscription is
/// dropped before acking.
#[derive(Default)]
pub struct MemoryBus {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    next_tag: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return queue.clone();
        }
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Messages waiting on `queue` that nobody has claimed
    pub fn pending(&self, queue: &str) -> usize {
        self.queue(queue).lock().ready.len()
    }

    /// Remove and return every unclaimed message on `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue)
            .lock()
            .ready
            .drain(..)
            .map(|e| e.payload)
            .collect()
    }

    /// Stop all queues; waiting subscribers observe the end of the stream
    pub fn close(&self) {
        let queues: Vec<_> = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for queue in queues {
            queue.lock().closed = true;
            queue.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let accepted = self.queue(queue).push_back(Envelope {
            tag,
            payload,
            redelivered: false,
        });
        if !accepted {
            return Err(BusError::PublishFailed {
                queue: queue.to_string(),
                reason: "bus is closed".to_string(),
            });
        }
        tracing::debug!("Published message {} to {}", tag, queue);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(MemorySubscription {
            name: queue.to_string(),
            queue: self.queue(queue),
            unacked: HashMap::new(),
        }))
    }
}

struct MemorySubscription {
    name: String,
    queue: Arc<Queue>,
    unacked: HashMap<u64, Envelope>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.queue.lock();
                match state.ready.pop_front() {
                    Some(envelope) => Ok(envelope),
                    None => Err(state.closed),
                }
            };

            match popped {
                Ok(envelope) => {
                    let delivery = Delivery {
                        queue: self.name.clone(),
                        tag: envelope.tag,
                        payload: envelope.payload.clone(),
                        redelivered: envelope.redelivered,
                    };
                    self.unacked.insert(envelope.tag, envelope);
                    return Ok(Some(delivery));
                }
                Err(true) => return Ok(None),
                Err(false) => notified.await,
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| BusError::AckFailed {
                delivery_tag: delivery.tag,
                reason: "delivery is not claimed by this subscription".to_string(),
            })
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let envelope = self
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| BusError::AckFailed {
                delivery_tag: delivery.tag,
                reason: "delivery is not claimed by this subscription".to_string(),
            })?;
        self.queue.requeue(envelope);
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        for (_, envelope) in self.unacked.drain() {
            self.queue.requeue(envelope);
        }
    }
}
