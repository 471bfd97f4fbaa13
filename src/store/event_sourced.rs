use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregate::{AggregateRegistry, AnyAggregate};
use crate::error::{Error, NotFound};
use crate::event::Event;
use crate::store::{AggregateStore, EventLog};
use crate::types::AggregateType;

/// [`AggregateStore`] keeping nothing but events: an aggregate is rebuilt by replaying its whole
/// stream onto a blank instance.
pub struct EventSourcedStore {
    registry: Arc<AggregateRegistry>,
    event_log: Arc<dyn EventLog>,
}

impl EventSourcedStore {
    pub fn new(registry: Arc<AggregateRegistry>, event_log: Arc<dyn EventLog>) -> Self {
        Self { registry, event_log }
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }
}

/// Applies events in stream order, refusing events produced by another aggregate type.
fn replay(aggregate: &mut dyn AnyAggregate, events: &[Event]) -> Result<(), Error> {
    for event in events {
        if event.aggregate_type() != aggregate.aggregate_type() {
            return Err(Error::Mismatch {
                expected: aggregate.aggregate_type().clone(),
                found: event.aggregate_type().clone(),
            });
        }

        aggregate.replay(event)?;
    }

    Ok(())
}

#[async_trait]
impl AggregateStore for EventSourcedStore {
    #[tracing::instrument(skip_all, fields(aggregate_type = %aggregate_type, aggregate_id = aggregate_id), err)]
    async fn load(&self, aggregate_type: &AggregateType, aggregate_id: &str) -> Result<Box<dyn AnyAggregate>, Error> {
        let mut aggregate = self.registry.create(aggregate_type, aggregate_id)?;

        let events: Vec<Event> = match self.event_log.load(aggregate_id).await {
            Ok(events) => events,
            Err(Error::NotFound(NotFound::EventStream(_))) => vec![],
            Err(error) => return Err(error),
        };

        replay(aggregate.as_mut(), &events)?;
        tracing::trace!(events = events.len(), "aggregate replayed");

        Ok(aggregate)
    }

    #[tracing::instrument(skip_all, fields(aggregate_type = %aggregate.aggregate_type(), aggregate_id = aggregate.id()), err)]
    async fn save(&self, aggregate: &mut dyn AnyAggregate) -> Result<(), Error> {
        if aggregate.pending_events().is_empty() {
            return Ok(());
        }

        self.event_log
            .save(aggregate.id(), aggregate.pending_events())
            .await?;
        let _ = aggregate.take_pending();

        Ok(())
    }
}
