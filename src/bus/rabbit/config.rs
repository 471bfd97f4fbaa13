use std::sync::Arc;
use std::time::Duration;

use lapin::ConnectionProperties;
use typed_builder::TypedBuilder;

use crate::codec::{EventCodec, JsonCodec};
use crate::config::{DEFAULT_MAX_DELIVER, DEFAULT_PREFETCH, DEFAULT_REDELIVERY_WAIT};

#[derive(TypedBuilder)]
pub struct RabbitEventBusConfig<'a> {
    /// The connection string for the RabbitMQ server, including the protocol, host, port, and
    /// virtual host.
    pub(crate) url: &'a str,
    /// Prefix of every exchange and queue name, so that applications sharing a broker do not see
    /// each other's events.
    pub(crate) app_namespace: &'a str,
    /// Additional connection properties.
    #[builder(default)]
    pub(crate) connection_properties: ConnectionProperties,
    /// How long a failed delivery is held before being handed back to the broker for redelivery.
    #[builder(default = DEFAULT_REDELIVERY_WAIT)]
    pub(crate) redelivery_wait: Duration,
    /// Delivery attempts after which a failing message is abandoned.
    #[builder(default = DEFAULT_MAX_DELIVER)]
    pub(crate) max_deliver: u32,
    /// Unacknowledged deliveries each consumer may hold at once.
    #[builder(default = DEFAULT_PREFETCH)]
    pub(crate) prefetch: u16,
    #[builder(default = Arc::new(JsonCodec))]
    pub(crate) codec: Arc<dyn EventCodec>,
}
