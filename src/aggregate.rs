use std::any::Any;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::encode_variant;
use crate::command::{Command, CommandEnvelope};
use crate::error::{Error, NotFound};
use crate::event::{DomainEvent, Event};
use crate::types::{AggregateType, Topic};

/// Identity and unsaved events of an aggregate instance.
///
/// Every concrete aggregate holds one and hands it out through [`Aggregate::root`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRoot {
    id: String,
    aggregate_type: AggregateType,
    #[serde(skip)]
    pending: Vec<Event>,
}

impl AggregateRoot {
    pub fn new(aggregate_type: impl Into<AggregateType>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            pending: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// Events published since the aggregate was last saved, in publication order.
    pub fn pending_events(&self) -> &[Event] {
        &self.pending
    }

    pub(crate) fn record(&mut self, event: Event) {
        self.pending.push(event);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }
}

/// An aggregate is a consistency boundary: its state changes only by handling its own commands,
/// which publish events, and by applying events.
///
/// The whole aggregate is serializable so that it can be kept as a snapshot; the pending events of
/// its [`AggregateRoot`] are never part of it.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    const TYPE: &'static str;
    type Command: Command;
    type Event: DomainEvent;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Builds a blank instance around its root.
    fn new(root: AggregateRoot) -> Self;

    fn root(&self) -> &AggregateRoot;

    fn root_mut(&mut self) -> &mut AggregateRoot;

    /// Runs the business rules for a command. Changes are made by calling [`Aggregate::publish_event`].
    fn handle_command(&mut self, command: Self::Command) -> Result<(), Self::Error>;

    /// Updates the aggregate state using a published or replayed event.
    fn apply_event(&mut self, event: Self::Event) -> Result<(), Self::Error>;

    /// Publishes an event from this aggregate.
    ///
    /// The event is applied to this same aggregate before it is recorded as pending, so the state
    /// already reflects it when this returns. An aggregate cannot reject its own event: a failure
    /// while applying it is logged and the event is recorded anyway.
    fn publish_event(&mut self, event: Self::Event, occurred_on: DateTime<Utc>) -> Result<Event, Error> {
        let (topic, payload) = encode_variant(&event)?;
        let root = self.root();
        let published = Event::new(
            Topic::from(topic),
            payload,
            root.aggregate_type().clone(),
            root.id(),
            occurred_on,
        );

        if let Err(error) = self.apply_event(event) {
            tracing::error!({
                aggregate_type = %published.aggregate_type(),
                aggregate_id = published.aggregate_id(),
                topic = %published.topic(),
                error = %error,
            }, "aggregate failed to apply its own event");
        }

        self.root_mut().record(published.clone());
        Ok(published)
    }
}

/// Type-erased view over any [`Aggregate`], used by stores, registries and command handlers.
pub trait AnyAggregate: Send + Sync {
    fn id(&self) -> &str;

    fn aggregate_type(&self) -> &AggregateType;

    fn pending_events(&self) -> &[Event];

    /// Removes and returns the pending events, marking them as persisted.
    fn take_pending(&mut self) -> Vec<Event>;

    /// Decodes the command into the aggregate's own command type and handles it.
    fn execute(&mut self, command: &CommandEnvelope) -> Result<(), Error>;

    /// Applies an already published event, as done while replaying a stream.
    fn replay(&mut self, event: &Event) -> Result<(), Error>;

    /// Materialized state of the aggregate.
    fn snapshot(&self) -> Result<Value, Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<A> AnyAggregate for A
where
    A: Aggregate,
{
    fn id(&self) -> &str {
        self.root().id()
    }

    fn aggregate_type(&self) -> &AggregateType {
        self.root().aggregate_type()
    }

    fn pending_events(&self) -> &[Event] {
        self.root().pending_events()
    }

    fn take_pending(&mut self) -> Vec<Event> {
        self.root_mut().take_pending()
    }

    fn execute(&mut self, command: &CommandEnvelope) -> Result<(), Error> {
        let command: A::Command = command.decode()?;
        self.handle_command(command).map_err(Error::application)
    }

    fn replay(&mut self, event: &Event) -> Result<(), Error> {
        let apply_error = |source: crate::error::BoxDynError| Error::Apply {
            topic: event.topic().clone(),
            aggregate_type: event.aggregate_type().clone(),
            aggregate_id: event.aggregate_id().to_owned(),
            source,
        };

        let payload: A::Event = event.decode().map_err(|error| apply_error(error.into()))?;
        self.apply_event(payload).map_err(|error| apply_error(error.into()))
    }

    fn snapshot(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyAggregate {
    /// Returns the concrete aggregate if it is an `A`.
    pub fn downcast_ref<A: Aggregate>(&self) -> Option<&A> {
        self.as_any().downcast_ref::<A>()
    }
}

type Factory = Box<dyn Fn(&str) -> Box<dyn AnyAggregate> + Send + Sync>;
type Restorer = Box<dyn Fn(Value) -> Result<Box<dyn AnyAggregate>, Error> + Send + Sync>;

struct Registration {
    factory: Factory,
    restorer: Restorer,
}

/// Maps every [`AggregateType`] to the factory building its instances.
///
/// Built once at process start and shared by reference; each type can be registered only once.
#[derive(Default)]
pub struct AggregateRegistry {
    registrations: RwLock<HashMap<AggregateType, Registration>>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `A` under [`Aggregate::TYPE`].
    ///
    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if the type is already registered; the existing
    /// registration is left untouched.
    pub fn register<A: Aggregate>(&self) -> Result<(), Error> {
        let aggregate_type = AggregateType::new(A::TYPE);
        if aggregate_type.is_empty() {
            return Err(Error::configuration("aggregate type must not be empty"));
        }

        let mut registrations = self.write();
        if registrations.contains_key(&aggregate_type) {
            return Err(Error::configuration(format!(
                "aggregate type `{aggregate_type}` registered twice"
            )));
        }

        let registration = Registration {
            factory: Box::new(|id: &str| Box::new(A::new(AggregateRoot::new(A::TYPE, id))) as Box<dyn AnyAggregate>),
            restorer: Box::new(|state: Value| Ok(Box::new(serde_json::from_value::<A>(state)?) as Box<dyn AnyAggregate>)),
        };
        registrations.insert(aggregate_type, registration);

        Ok(())
    }

    /// Builds a blank instance of the given type.
    pub fn create(&self, aggregate_type: &AggregateType, id: &str) -> Result<Box<dyn AnyAggregate>, Error> {
        let registrations = self.read();
        let registration = registrations
            .get(aggregate_type)
            .ok_or_else(|| NotFound::AggregateType(aggregate_type.clone()))?;

        Ok((registration.factory)(id))
    }

    /// Rebuilds an instance of the given type from its materialized state.
    pub fn restore(&self, aggregate_type: &AggregateType, state: Value) -> Result<Box<dyn AnyAggregate>, Error> {
        let registrations = self.read();
        let registration = registrations
            .get(aggregate_type)
            .ok_or_else(|| NotFound::AggregateType(aggregate_type.clone()))?;

        let aggregate = (registration.restorer)(state)?;
        if aggregate.aggregate_type() != aggregate_type {
            return Err(Error::Mismatch {
                expected: aggregate_type.clone(),
                found: aggregate.aggregate_type().clone(),
            });
        }

        Ok(aggregate)
    }

    pub fn contains(&self, aggregate_type: &AggregateType) -> bool {
        self.read().contains_key(aggregate_type)
    }

    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        let mut types: Vec<AggregateType> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AggregateType, Registration>> {
        self.registrations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AggregateType, Registration>> {
        self.registrations.write().unwrap_or_else(PoisonError::into_inner)
    }
}
