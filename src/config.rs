use std::sync::Arc;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::codec::{EventCodec, JsonCodec};

/// Messages buffered per topic by the in-process event bus before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
/// Delay every in-process consumer waits before handling a message.
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(1);
/// How long a failed delivery waits before the broker redelivers it.
pub const DEFAULT_REDELIVERY_WAIT: Duration = Duration::from_secs(60);
/// Delivery attempts after which a message is abandoned.
pub const DEFAULT_MAX_DELIVER: u32 = 10;
/// Unacknowledged deliveries a broker consumer may hold at once.
pub const DEFAULT_PREFETCH: u16 = 16;

#[derive(TypedBuilder)]
pub struct LocalEventBusConfig {
    /// Capacity of every topic queue. Publishing onto a full queue drops the message.
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub(crate) queue_capacity: usize,
    /// Pause taken by each consumer before decoding and dispatching a message.
    #[builder(default = DEFAULT_PACING_DELAY)]
    pub(crate) pacing_delay: Duration,
    /// Codec used to put events on, and take them off, the topic queues.
    #[builder(default = Arc::new(JsonCodec))]
    pub(crate) codec: Arc<dyn EventCodec>,
}

impl Default for LocalEventBusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
