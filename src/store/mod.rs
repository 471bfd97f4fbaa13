use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use event_sourced::EventSourcedStore;
pub use memory::{InMemoryEventLog, InMemorySnapshotRepository};
pub use snapshot::SnapshotStore;

use crate::aggregate::AnyAggregate;
use crate::error::Error;
use crate::event::Event;
use crate::types::AggregateType;

mod event_sourced;
mod memory;
mod snapshot;

/// An AggregateStore is responsible for loading the latest state of an aggregate instance and for
/// saving it back after a command was handled.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Loads the aggregate instance, or a blank one if it has no history yet.
    async fn load(&self, aggregate_type: &AggregateType, aggregate_id: &str) -> Result<Box<dyn AnyAggregate>, Error>;

    /// Persists the aggregate. Its pending events are considered persisted afterwards.
    async fn save(&self, aggregate: &mut dyn AnyAggregate) -> Result<(), Error>;
}

/// Append-only storage of per-identity event streams.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Loads every event saved for an identity, in append order.
    ///
    /// # Errors
    ///
    /// Will return [`crate::NotFound::EventStream`] if nothing was ever saved for the identity.
    async fn load(&self, aggregate_id: &str) -> Result<Vec<Event>, Error>;

    /// Appends events to the identity's stream.
    async fn save(&self, aggregate_id: &str, events: &[Event]) -> Result<(), Error>;
}

/// Latest materialized state of an aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub state: Value,
    pub taken_on: DateTime<Utc>,
}

/// Key-value storage of snapshots, keyed by aggregate identity.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// # Errors
    ///
    /// Will return [`crate::NotFound::Snapshot`] if there is no snapshot for the identity.
    async fn find(&self, aggregate_id: &str) -> Result<Snapshot, Error>;

    async fn find_all(&self) -> Result<Vec<Snapshot>, Error>;

    /// Stores the snapshot, replacing any previous one for the same identity.
    async fn save(&self, snapshot: Snapshot) -> Result<(), Error>;

    async fn remove(&self, aggregate_id: &str) -> Result<(), Error>;
}
