use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, NotFound};
use crate::event::Event;
use crate::store::{EventLog, Snapshot, SnapshotRepository};

/// [`EventLog`] living in memory, mostly useful for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryEventLog {
    streams: RwLock<BTreeMap<String, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn load(&self, aggregate_id: &str) -> Result<Vec<Event>, Error> {
        self.streams
            .read()
            .await
            .get(aggregate_id)
            .cloned()
            .ok_or_else(|| NotFound::EventStream(aggregate_id.to_owned()).into())
    }

    async fn save(&self, aggregate_id: &str, events: &[Event]) -> Result<(), Error> {
        self.streams
            .write()
            .await
            .entry(aggregate_id.to_owned())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySnapshotRepository {
    snapshots: RwLock<BTreeMap<String, Snapshot>>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn find(&self, aggregate_id: &str) -> Result<Snapshot, Error> {
        self.snapshots
            .read()
            .await
            .get(aggregate_id)
            .cloned()
            .ok_or_else(|| NotFound::Snapshot(aggregate_id.to_owned()).into())
    }

    async fn find_all(&self) -> Result<Vec<Snapshot>, Error> {
        Ok(self.snapshots.read().await.values().cloned().collect())
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), Error> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn remove(&self, aggregate_id: &str) -> Result<(), Error> {
        self.snapshots
            .write()
            .await
            .remove(aggregate_id)
            .map(|_| ())
            .ok_or_else(|| NotFound::Snapshot(aggregate_id.to_owned()).into())
    }
}
