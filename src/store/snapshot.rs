use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::aggregate::{AggregateRegistry, AnyAggregate};
use crate::error::{Error, NotFound};
use crate::store::{AggregateStore, Snapshot, SnapshotRepository};
use crate::types::AggregateType;

/// [`AggregateStore`] keeping only the latest state of every aggregate instance.
///
/// Events are not stored: saving overwrites the previous snapshot, last writer wins.
pub struct SnapshotStore {
    registry: Arc<AggregateRegistry>,
    repository: Arc<dyn SnapshotRepository>,
}

impl SnapshotStore {
    pub fn new(registry: Arc<AggregateRegistry>, repository: Arc<dyn SnapshotRepository>) -> Self {
        Self { registry, repository }
    }

    pub fn repository(&self) -> &Arc<dyn SnapshotRepository> {
        &self.repository
    }
}

#[async_trait]
impl AggregateStore for SnapshotStore {
    #[tracing::instrument(skip_all, fields(aggregate_type = %aggregate_type, aggregate_id = aggregate_id), err)]
    async fn load(&self, aggregate_type: &AggregateType, aggregate_id: &str) -> Result<Box<dyn AnyAggregate>, Error> {
        match self.repository.find(aggregate_id).await {
            Ok(snapshot) => {
                if &snapshot.aggregate_type != aggregate_type {
                    return Err(Error::Mismatch {
                        expected: aggregate_type.clone(),
                        found: snapshot.aggregate_type,
                    });
                }
                self.registry.restore(aggregate_type, snapshot.state)
            }
            Err(Error::NotFound(NotFound::Snapshot(_))) => self.registry.create(aggregate_type, aggregate_id),
            Err(error) => Err(error),
        }
    }

    #[tracing::instrument(skip_all, fields(aggregate_type = %aggregate.aggregate_type(), aggregate_id = aggregate.id()), err)]
    async fn save(&self, aggregate: &mut dyn AnyAggregate) -> Result<(), Error> {
        let snapshot = Snapshot {
            aggregate_type: aggregate.aggregate_type().clone(),
            aggregate_id: aggregate.id().to_owned(),
            state: aggregate.snapshot()?,
            taken_on: Utc::now(),
        };

        self.repository.save(snapshot).await?;
        let _ = aggregate.take_pending();

        Ok(())
    }
}
