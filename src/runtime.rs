use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::aggregate::{Aggregate, AggregateRegistry};
use crate::bus::{EventBus, EventHandler};
use crate::command::{AggregateCommandHandler, CommandBus, CommandEnvelope, CommandHandler, CommandRegistry, Dispatched};
use crate::error::Error;
use crate::saga::{SagaRegistry, SagaRepository};
use crate::store::AggregateStore;
use crate::types::{AggregateType, Topic};

/// Definitions of the whole application: aggregate types, command routes and sagas.
///
/// Filled once at process start, then handed to [`Runtime::bootstrap`].
#[derive(Default)]
pub struct Registry {
    pub aggregates: Arc<AggregateRegistry>,
    pub commands: CommandRegistry,
    pub sagas: SagaRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Collaborators the runtime is wired with.
#[derive(TypedBuilder)]
pub struct Components {
    pub(crate) command_bus: Arc<dyn CommandBus>,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) store: Arc<dyn AggregateStore>,
    pub(crate) saga_repository: Arc<dyn SagaRepository>,
    /// Plain event handlers, subscribed next to the sagas.
    #[builder(default)]
    pub(crate) event_handlers: Vec<(Topic, Arc<dyn EventHandler>)>,
}

/// A running application: every command routed to its aggregate, every saga subscribed.
pub struct Runtime {
    registry: Arc<Registry>,
    command_bus: Arc<dyn CommandBus>,
    event_bus: Arc<dyn EventBus>,
    store: Arc<dyn AggregateStore>,
}

impl Runtime {
    /// Installs one [`AggregateCommandHandler`] per aggregate type for all of its commands, then
    /// subscribes the event handlers and the sagas.
    ///
    /// # Errors
    ///
    /// Any failure aborts the bring-up; a command routed to an unregistered aggregate type is a
    /// [`Error::Configuration`].
    pub async fn bootstrap(registry: Arc<Registry>, components: Components) -> Result<Self, Error> {
        let Components {
            command_bus,
            event_bus,
            store,
            saga_repository,
            event_handlers,
        } = components;

        let mut handlers: Vec<(AggregateType, Arc<dyn CommandHandler>)> = Vec::new();
        for (command, aggregate_type) in registry.commands.commands() {
            if !registry.aggregates.contains(&aggregate_type) {
                return Err(Error::configuration(format!(
                    "command `{command}` targets unregistered aggregate type `{aggregate_type}`"
                )));
            }

            let handler = match handlers.iter().find(|(known, _)| known == &aggregate_type) {
                Some((_, handler)) => handler.clone(),
                None => {
                    let handler: Arc<dyn CommandHandler> = Arc::new(AggregateCommandHandler::new(
                        aggregate_type.clone(),
                        store.clone(),
                        event_bus.clone(),
                    ));
                    handlers.push((aggregate_type.clone(), handler.clone()));
                    handler
                }
            };

            command_bus.register_handler(command, handler).await?;
        }

        for (topic, handler) in event_handlers {
            event_bus.register_handler(topic, handler).await?;
        }

        registry
            .sagas
            .prepare(event_bus.as_ref(), command_bus.clone(), saga_repository)
            .await?;

        tracing::info!(
            aggregate_types = handlers.len(),
            sagas = registry.sagas.saga_types().len(),
            "runtime started"
        );

        Ok(Self {
            registry,
            command_bus,
            event_bus,
            store,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn command_bus(&self) -> &Arc<dyn CommandBus> {
        &self.command_bus
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Checks the command against the registry and dispatches it.
    pub async fn send(&self, command: CommandEnvelope) -> Result<Dispatched, Error> {
        self.registry.commands.verify(&command)?;
        self.command_bus.dispatch(command).await
    }

    /// Sends a typed command to an instance of `A`.
    pub async fn send_command<A: Aggregate>(&self, command: &A::Command) -> Result<Dispatched, Error> {
        self.send(CommandEnvelope::for_aggregate::<A>(command)?).await
    }
}
