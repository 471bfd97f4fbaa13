use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::ManageConnection;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

pub use config::RabbitEventBusConfig;
pub use error::RabbitEventBusError;

use crate::bus::{EventBus, EventHandler};
use crate::codec::EventCodec;
use crate::error::Error;
use crate::event::Event;
use crate::types::{AggregateType, Topic};

mod config;
mod error;

/// Naming of exchanges, routing keys and queues for one application namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    namespace: String,
}

impl Subjects {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Topic exchange every event of the namespace is published to.
    pub fn exchange(&self) -> String {
        format!("{}_events", self.namespace)
    }

    pub fn routing_key(&self, aggregate_type: &AggregateType, topic: &Topic) -> String {
        format!("{}_events.{}.{}", self.namespace, aggregate_type, topic)
    }

    /// Binding matching a topic whatever the aggregate type that produced it.
    pub fn binding_key(&self, topic: &Topic) -> String {
        format!("{}_events.*.{}", self.namespace, topic)
    }

    /// Default queue group of a topic.
    pub fn queue_group(&self, topic: &Topic) -> String {
        format!("{}_{}", self.namespace, topic)
    }
}

pub struct RabbitConnectionManager {
    url: String,
    connection_properties: ConnectionProperties,
}

#[async_trait]
impl ManageConnection for RabbitConnectionManager {
    type Connection = Connection;
    type Error = lapin::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Connection::connect(&self.url, self.connection_properties.to_owned()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        if self.has_broken(conn) {
            return Err(lapin::Error::InvalidConnectionState(conn.status().state()));
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.status().connected()
    }
}

/// Hands out publishing channels with publisher confirms enabled and the namespace exchange
/// declared.
pub struct RabbitChannelManager {
    connection_pool: bb8::Pool<RabbitConnectionManager>,
    exchange: String,
}

#[async_trait]
impl ManageConnection for RabbitChannelManager {
    type Connection = Channel;
    type Error = lapin::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let connection = match self.connection_pool.get().await {
            Ok(connection) => connection,
            Err(e) => match e {
                bb8::RunError::User(e) => return Err(e),
                bb8::RunError::TimedOut => return Err(lapin::Error::InvalidChannelState(lapin::ChannelState::Closed)),
            },
        };
        let channel = connection.create_channel().await?;
        declare_exchange(&channel, &self.exchange).await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(channel)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        if self.has_broken(conn) {
            return Err(lapin::Error::InvalidChannelState(conn.status().state()));
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.status().connected()
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    let options = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    channel
        .exchange_declare(exchange, ExchangeKind::Topic, options, FieldTable::default())
        .await
}

/// The [`RabbitEventBus`] provides an implementation of the `EventBus` trait on top of RabbitMQ.
///
/// Every handler consumes from a durable quorum queue named after its queue group. Handlers sharing
/// a queue group compete for messages, while every queue group receives its own copy of each event.
/// Deliveries are acknowledged once handled; a failing delivery is handed back to the broker after
/// the redelivery wait, and abandoned once it reached the maximum number of attempts.
pub struct RabbitEventBus {
    channel_pool: bb8::Pool<RabbitChannelManager>,
    consumer_connection: Connection,
    subjects: Subjects,
    redelivery_wait: Duration,
    max_deliver: u32,
    prefetch: u16,
    codec: Arc<dyn EventCodec>,
    cancellation: CancellationToken,
    consumers: TaskTracker,
}

impl RabbitEventBus {
    pub async fn new(config: RabbitEventBusConfig<'_>) -> Result<RabbitEventBus, RabbitEventBusError> {
        let subjects = Subjects::new(config.app_namespace);

        let connection_manager = RabbitConnectionManager {
            url: config.url.to_string(),
            connection_properties: config.connection_properties.clone(),
        };

        let connection_pool = bb8::Pool::builder()
            .max_size(2)
            .max_lifetime(Some(Duration::from_secs(10 * 60)))
            .idle_timeout(Some(Duration::from_secs(5 * 60)))
            .min_idle(Some(1))
            .build(connection_manager)
            .await?;

        let channel_manager = RabbitChannelManager {
            connection_pool,
            exchange: subjects.exchange(),
        };

        let channel_pool = bb8::Pool::builder()
            .max_size(10)
            .max_lifetime(Some(Duration::from_secs(5 * 60)))
            .idle_timeout(Some(Duration::from_secs(60)))
            .min_idle(Some(1))
            .build(channel_manager)
            .await?;

        let consumer_connection = Connection::connect(config.url, config.connection_properties).await?;

        Ok(Self {
            channel_pool,
            consumer_connection,
            subjects,
            redelivery_wait: config.redelivery_wait,
            max_deliver: config.max_deliver,
            prefetch: config.prefetch,
            codec: config.codec,
            cancellation: CancellationToken::new(),
            consumers: TaskTracker::new(),
        })
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Starts delivering events of `topic` to `handler` as a member of the `group` queue group.
    pub async fn register_handler_in_group(
        &self,
        group: &str,
        topic: &Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RabbitEventBusError> {
        let channel = self.consumer_connection.create_channel().await?;
        let exchange = self.subjects.exchange();
        declare_exchange(&channel, &exchange).await?;

        let mut arguments = FieldTable::default();
        arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        arguments.insert(
            "x-delivery-limit".into(),
            AMQPValue::LongLongInt(i64::from(self.max_deliver)),
        );

        let queue_options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel.queue_declare(group, queue_options, arguments).await?;
        channel
            .queue_bind(
                group,
                &exchange,
                &self.subjects.binding_key(topic),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("{}-{}", group, Uuid::new_v4());
        let consumer = channel
            .basic_consume(group, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let worker = Worker {
            group: group.to_owned(),
            topic: topic.clone(),
            handler,
            codec: self.codec.clone(),
            redelivery_wait: self.redelivery_wait,
            max_deliver: self.max_deliver,
            cancellation: self.cancellation.clone(),
            consumers: self.consumers.clone(),
        };

        self.consumers.spawn(worker.run(channel, consumer));
        Ok(())
    }

    /// Stops every consumer; unacknowledged deliveries go back to their queue.
    pub async fn close(&self) -> Result<(), RabbitEventBusError> {
        self.cancellation.cancel();
        self.consumers.close();
        self.consumers.wait().await;
        self.consumer_connection.close(200, "closing").await?;
        Ok(())
    }

    async fn send(&self, event: &Event, bytes: &[u8]) -> Result<(), RabbitEventBusError> {
        let routing_key = self.subjects.routing_key(event.aggregate_type(), event.topic());
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_message_id(event.id().to_string().into())
            .with_content_type("application/json".into());

        let channel = self.channel_pool.get().await?;
        let confirmation: Confirmation = channel
            .basic_publish(
                self.subjects.exchange().as_str(),
                routing_key.as_str(),
                BasicPublishOptions::default(),
                bytes,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(_) => Ok(()),
            Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(RabbitEventBusError::PublishNack),
        }
    }
}

#[async_trait]
impl EventBus for RabbitEventBus {
    async fn publish(&self, event: &Event) -> Result<(), Error> {
        let bytes: Vec<u8> = self.codec.encode_event(event)?;
        Ok(self.send(event, &bytes).await?)
    }

    async fn register_handler(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        let group = self.subjects.queue_group(&topic);
        Ok(self.register_handler_in_group(&group, &topic, handler).await?)
    }
}

struct Worker {
    group: String,
    topic: Topic,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn EventCodec>,
    redelivery_wait: Duration,
    max_deliver: u32,
    cancellation: CancellationToken,
    consumers: TaskTracker,
}

impl Worker {
    async fn run(self, channel: Channel, mut consumer: Consumer) {
        loop {
            let delivery = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(error)) => {
                        tracing::error!({ queue_group = %self.group, error = %error }, "broker consumer failed");
                        break;
                    }
                    None => break,
                },
            };

            self.process(delivery).await;
        }

        if let Err(error) = channel.close(200, "consumer stopped").await {
            tracing::debug!({ queue_group = %self.group, error = %error }, "failed to close consumer channel");
        }
    }

    async fn process(&self, delivery: Delivery) {
        let outcome = match self.codec.decode_event(&delivery.data) {
            Ok(event) => {
                let span = tracing::debug_span!(
                    "eventide.event_handler",
                    event_handler = self.handler.name(),
                    queue_group = %self.group,
                    topic = %event.topic(),
                    aggregate_type = %event.aggregate_type(),
                    aggregate_id = event.aggregate_id(),
                );
                self.handler.handle(&event).instrument(span).await
            }
            Err(error) => Err(error),
        };

        let result = match outcome {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await,
            Err(error) => {
                let attempt = delivery_attempt(&delivery);
                if attempt >= self.max_deliver {
                    tracing::error!({
                        queue_group = %self.group,
                        topic = %self.topic,
                        attempt,
                        error = %error,
                    }, "delivery failed too many times, abandoning it");
                    delivery.reject(BasicRejectOptions { requeue: false }).await
                } else {
                    tracing::warn!({
                        queue_group = %self.group,
                        topic = %self.topic,
                        attempt,
                        error = %error,
                    }, "delivery failed, it will be redelivered");
                    self.nack_later(delivery);
                    Ok(())
                }
            }
        };

        if let Err(error) = result {
            tracing::error!({ queue_group = %self.group, error = %error }, "failed to settle delivery");
        }
    }

    /// Hands the delivery back to the broker once the redelivery wait elapsed. On shutdown the
    /// delivery is left unsettled and the broker requeues it when the channel closes.
    fn nack_later(&self, delivery: Delivery) {
        let wait = self.redelivery_wait;
        let cancellation = self.cancellation.clone();
        let group = self.group.clone();

        self.consumers.spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let options = BasicNackOptions { multiple: false, requeue: true };
                    if let Err(error) = delivery.nack(options).await {
                        tracing::error!({ queue_group = %group, error = %error }, "failed to nack delivery");
                    }
                }
            }
        });
    }
}

/// 1-based delivery attempt of a message, read from the count quorum queues attach to redeliveries.
fn delivery_attempt(delivery: &Delivery) -> u32 {
    let previous = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "x-delivery-count")
                .and_then(|(_, value)| delivery_count(value))
        })
        .unwrap_or(u32::from(delivery.redelivered));

    previous.saturating_add(1)
}

fn delivery_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(count) => Some(u32::from(*count)),
        AMQPValue::ShortUInt(count) => Some(u32::from(*count)),
        AMQPValue::LongUInt(count) => Some(*count),
        AMQPValue::ShortShortInt(count) => u32::try_from(*count).ok(),
        AMQPValue::ShortInt(count) => u32::try_from(*count).ok(),
        AMQPValue::LongInt(count) => u32::try_from(*count).ok(),
        AMQPValue::LongLongInt(count) => u32::try_from(*count).ok(),
        _ => None,
    }
}
