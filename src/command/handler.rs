use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::command::{CommandEnvelope, CommandHandler};
use crate::error::Error;
use crate::lock::KeyedLocks;
use crate::store::AggregateStore;
use crate::types::AggregateType;

/// The production [`CommandHandler`], installed once per aggregate type.
///
/// For every command it loads the target aggregate, lets it handle the command, publishes the
/// events it produced and saves it. The whole cycle runs while holding a lock on the target
/// identity, so commands for the same aggregate instance never interleave.
///
/// Events are published before the aggregate is saved: a crash in between leaves consumers with
/// events whose originating state was never persisted, and retrying the command publishes them
/// again. Event handlers must be idempotent.
pub struct AggregateCommandHandler {
    aggregate_type: AggregateType,
    store: Arc<dyn AggregateStore>,
    event_bus: Arc<dyn EventBus>,
    locks: KeyedLocks,
}

impl AggregateCommandHandler {
    pub fn new(aggregate_type: impl Into<AggregateType>, store: Arc<dyn AggregateStore>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            store,
            event_bus,
            locks: KeyedLocks::new(),
        }
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }
}

#[async_trait]
impl CommandHandler for AggregateCommandHandler {
    #[tracing::instrument(skip_all, fields(command = %command.name(), aggregate_type = %command.aggregate_type(), aggregate_id = command.aggregate_id()), err)]
    async fn handle(&self, command: &CommandEnvelope) -> Result<(), Error> {
        if command.aggregate_type() != &self.aggregate_type {
            return Err(Error::Mismatch {
                expected: self.aggregate_type.clone(),
                found: command.aggregate_type().clone(),
            });
        }

        let _guard = self.locks.lock(command.aggregate_id()).await;

        let mut aggregate = self.store.load(&self.aggregate_type, command.aggregate_id()).await?;
        aggregate.execute(command)?;

        for event in aggregate.pending_events() {
            self.event_bus.publish(event).await?;
        }

        self.store.save(aggregate.as_mut()).await
    }

    fn name(&self) -> &'static str {
        "AggregateCommandHandler"
    }
}
