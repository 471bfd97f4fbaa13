use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::Instrument;

use crate::bus::{EventBus, EventHandler};
use crate::command::CommandBus;
use crate::error::Error;
use crate::event::Event;
use crate::lock::KeyedLocks;
use crate::saga::{Resolver, Saga, SagaDefinition, SagaFactory, SagaLifecycle, SagaRecord, SagaRepository};
use crate::types::Topic;

/// Runs every instance of one saga type. Registered on the event bus for each topic the saga
/// listens to.
pub struct SagaManager<S> {
    saga_type: String,
    topics: HashSet<Topic>,
    end_topics: HashSet<Topic>,
    factory: SagaFactory<S>,
    resolver: Resolver,
    repository: Arc<dyn SagaRepository>,
    commands: Arc<dyn CommandBus>,
    locks: KeyedLocks,
}

impl<S> SagaManager<S>
where
    S: Saga,
{
    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if the definition is incomplete.
    pub fn new(
        definition: SagaDefinition<S>,
        repository: Arc<dyn SagaRepository>,
        commands: Arc<dyn CommandBus>,
    ) -> Result<Self, Error> {
        definition.validate()?;

        let topics = definition.topics().into_iter().collect();
        let end_topics = definition.end_topics().iter().cloned().collect();
        let SagaDefinition {
            saga_type,
            factory,
            resolver,
            ..
        } = definition;

        match (factory, resolver) {
            (Some(factory), Some(resolver)) => Ok(Self {
                saga_type,
                topics,
                end_topics,
                factory,
                resolver,
                repository,
                commands,
                locks: KeyedLocks::new(),
            }),
            _ => Err(Error::configuration(format!("saga `{saga_type}` is incomplete"))),
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    async fn load_or_start(&self, correlation_id: &str) -> Result<S, Error> {
        match self.repository.load(&self.saga_type, correlation_id).await? {
            Some(record) => record.restore(),
            None => {
                let mut saga = (self.factory)(SagaLifecycle::new(self.saga_type.as_str(), correlation_id));
                saga.lifecycle_mut().start();
                tracing::debug!("saga started");
                Ok(saga)
            }
        }
    }

    async fn step(&self, correlation_id: &str, event: &Event) -> Result<(), Error> {
        let _guard = self.locks.lock(correlation_id).await;

        let mut saga = self.load_or_start(correlation_id).await?;
        if !saga.lifecycle().is_alive() {
            return Err(Error::SagaNotAlive {
                saga_type: self.saga_type.clone(),
                correlation_id: correlation_id.to_owned(),
            });
        }

        let outcome = saga.handle_event(event, self.commands.as_ref()).await;

        if self.end_topics.contains(event.topic()) {
            saga.lifecycle_mut().end();
            tracing::debug!("saga ended");
        }

        self.repository.save(SagaRecord::of(&saga)?).await?;
        outcome
    }
}

#[async_trait]
impl<S> EventHandler for SagaManager<S>
where
    S: Saga,
{
    async fn handle(&self, event: &Event) -> Result<(), Error> {
        if !self.topics.contains(event.topic()) {
            tracing::trace!(saga_type = %self.saga_type, topic = %event.topic(), "topic not handled by saga");
            return Ok(());
        }

        let correlation_id = (self.resolver)(event)?;
        let span = tracing::debug_span!(
            "eventide.saga",
            saga_type = %self.saga_type,
            correlation_id = %correlation_id,
            topic = %event.topic(),
        );

        self.step(&correlation_id, event).instrument(span).await
    }

    fn name(&self) -> &'static str {
        "SagaManager"
    }
}

/// A registered saga type, waiting for its collaborators.
trait SagaBinding: Send + Sync {
    fn topics(&self) -> Vec<Topic>;

    fn bind(&self, repository: Arc<dyn SagaRepository>, commands: Arc<dyn CommandBus>) -> Result<Arc<dyn EventHandler>, Error>;
}

impl<S> SagaBinding for SagaDefinition<S>
where
    S: Saga,
{
    fn topics(&self) -> Vec<Topic> {
        SagaDefinition::topics(self)
    }

    fn bind(&self, repository: Arc<dyn SagaRepository>, commands: Arc<dyn CommandBus>) -> Result<Arc<dyn EventHandler>, Error> {
        Ok(Arc::new(SagaManager::new(self.clone(), repository, commands)?))
    }
}

/// Every saga type of the application, each registered once.
#[derive(Default)]
pub struct SagaRegistry {
    sagas: RwLock<BTreeMap<String, Arc<dyn SagaBinding>>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if the definition is incomplete or its saga type is
    /// already registered; existing registrations are left untouched.
    pub fn register<S: Saga>(&self, definition: SagaDefinition<S>) -> Result<(), Error> {
        definition.validate()?;

        let mut sagas = self.sagas.write().unwrap_or_else(PoisonError::into_inner);
        if sagas.contains_key(definition.saga_type()) {
            return Err(Error::configuration(format!(
                "saga `{}` registered twice",
                definition.saga_type()
            )));
        }

        sagas.insert(definition.saga_type().to_owned(), Arc::new(definition));
        Ok(())
    }

    pub fn saga_types(&self) -> Vec<String> {
        self.sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribes every registered saga to each topic it listens to.
    pub async fn prepare(
        &self,
        event_bus: &dyn EventBus,
        commands: Arc<dyn CommandBus>,
        repository: Arc<dyn SagaRepository>,
    ) -> Result<(), Error> {
        let bindings: Vec<(String, Arc<dyn SagaBinding>)> = self
            .sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(saga_type, binding)| (saga_type.clone(), binding.clone()))
            .collect();

        for (saga_type, binding) in bindings {
            let handler = binding.bind(repository.clone(), commands.clone())?;
            for topic in binding.topics() {
                tracing::debug!(saga_type = %saga_type, topic = %topic, "subscribing saga");
                event_bus.register_handler(topic, handler.clone()).await?;
            }
        }

        Ok(())
    }
}
