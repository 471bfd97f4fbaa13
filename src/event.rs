use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::decode_variant;
use crate::types::{AggregateType, Topic};

/// The closed set of events an aggregate emits, usually an enum.
///
/// The variant name becomes the event [`Topic`] and the variant content its payload.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> DomainEvent for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// An immutable fact emitted by an aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    topic: Topic,
    payload: Value,
    aggregate_type: AggregateType,
    aggregate_id: String,
    occurred_on: DateTime<Utc>,
}

impl Event {
    pub fn new(
        topic: impl Into<Topic>,
        payload: Value,
        aggregate_type: impl Into<AggregateType>,
        aggregate_id: impl Into<String>,
        occurred_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            occurred_on,
        }
    }

    /// Uniquely identifies an event among all events emitted from all aggregates.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    /// Rebuilds the typed variant this event was published from.
    pub fn decode<E>(&self) -> Result<E, serde_json::Error>
    where
        E: DeserializeOwned,
    {
        decode_variant(self.topic.as_str(), &self.payload)
    }
}
