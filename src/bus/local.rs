use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::bus::{EventBus, EventHandler};
use crate::codec::EventCodec;
use crate::config::LocalEventBusConfig;
use crate::error::{Error, TransportError};
use crate::event::Event;
use crate::types::Topic;

/// A fixed-capacity FIFO queue. Every consumer registered for the topic pulls from the same
/// receiver.
struct TopicQueue {
    sender: Sender<Vec<u8>>,
    receiver: Arc<Mutex<Receiver<Vec<u8>>>>,
}

impl TopicQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// In-process [`EventBus`] with one bounded queue per topic.
///
/// Publishing never waits: when a topic queue is full the event is dropped with a warning.
/// Handlers registered on the same topic are competing consumers of its queue, so each event is
/// delivered to exactly one of them.
pub struct LocalEventBus {
    queues: RwLock<HashMap<Topic, TopicQueue>>,
    capacity: usize,
    pacing_delay: Duration,
    codec: Arc<dyn EventCodec>,
    cancellation: CancellationToken,
    consumers: TaskTracker,
}

impl LocalEventBus {
    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if the queue capacity is zero.
    pub fn new(config: LocalEventBusConfig) -> Result<Self, Error> {
        if config.queue_capacity == 0 {
            return Err(Error::configuration("event bus queue capacity must be greater than zero"));
        }

        Ok(Self::with_config(config))
    }

    fn with_config(config: LocalEventBusConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            capacity: config.queue_capacity,
            pacing_delay: config.pacing_delay,
            codec: config.codec,
            cancellation: CancellationToken::new(),
            consumers: TaskTracker::new(),
        }
    }

    /// Number of events waiting in the queue of `topic`.
    pub async fn queued(&self, topic: &Topic) -> usize {
        self.queues
            .read()
            .await
            .get(topic)
            .map_or(0, |queue| queue.sender.max_capacity() - queue.sender.capacity())
    }

    /// Stops every consumer and discards the events still queued.
    pub async fn close(&self) {
        self.cancellation.cancel();
        self.consumers.close();
        self.consumers.wait().await;
        self.queues.write().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    async fn sender(&self, topic: &Topic) -> Sender<Vec<u8>> {
        if let Some(queue) = self.queues.read().await.get(topic) {
            return queue.sender.clone();
        }

        self.queues
            .write()
            .await
            .entry(topic.clone())
            .or_insert_with(|| TopicQueue::new(self.capacity))
            .sender
            .clone()
    }

    async fn receiver(&self, topic: &Topic) -> Arc<Mutex<Receiver<Vec<u8>>>> {
        self.queues
            .write()
            .await
            .entry(topic.clone())
            .or_insert_with(|| TopicQueue::new(self.capacity))
            .receiver
            .clone()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::with_config(LocalEventBusConfig::default())
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: &Event) -> Result<(), Error> {
        if self.is_closed() {
            return Err(TransportError::QueueClosed(event.topic().clone()).into());
        }

        let bytes = self.codec.encode_event(event)?;
        let sender = self.sender(event.topic()).await;

        match sender.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!({
                    topic = %event.topic(),
                    aggregate_type = %event.aggregate_type(),
                    aggregate_id = event.aggregate_id(),
                    event_id = %event.id(),
                    capacity = self.capacity,
                }, "topic queue is full, dropping event");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::QueueClosed(event.topic().clone()).into()),
        }
    }

    async fn register_handler(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(TransportError::QueueClosed(topic).into());
        }

        let receiver = self.receiver(&topic).await;
        let consumer = Consumer {
            topic,
            receiver,
            handler,
            codec: self.codec.clone(),
            pacing_delay: self.pacing_delay,
            cancellation: self.cancellation.clone(),
        };

        self.consumers.spawn(consumer.run());
        Ok(())
    }
}

struct Consumer {
    topic: Topic,
    receiver: Arc<Mutex<Receiver<Vec<u8>>>>,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn EventCodec>,
    pacing_delay: Duration,
    cancellation: CancellationToken,
}

impl Consumer {
    async fn run(self) {
        loop {
            let bytes = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                bytes = async { self.receiver.lock().await.recv().await } => match bytes {
                    Some(bytes) => bytes,
                    None => break,
                },
            };

            tokio::time::sleep(self.pacing_delay).await;

            let event = match self.codec.decode_event(&bytes) {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!({ topic = %self.topic, error = %error }, "failed to decode event, dropping it");
                    continue;
                }
            };

            let span = tracing::debug_span!(
                "eventide.event_handler",
                event_handler = self.handler.name(),
                topic = %event.topic(),
                aggregate_type = %event.aggregate_type(),
                aggregate_id = event.aggregate_id(),
            );

            if let Err(error) = self.handler.handle(&event).instrument(span).await {
                tracing::error!({
                    event_handler = self.handler.name(),
                    topic = %event.topic(),
                    event_id = %event.id(),
                    error = %error,
                }, "event handler failed, dropping event");
            }
        }

        tracing::debug!(topic = %self.topic, event_handler = self.handler.name(), "event consumer stopped");
    }
}
