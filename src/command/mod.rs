use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use handler::AggregateCommandHandler;
pub use local::{Dispatched, LocalCommandBus};

use crate::aggregate::Aggregate;
use crate::codec::{decode_variant, encode_variant};
use crate::error::{Error, NotFound};
use crate::types::{AggregateType, CommandName};

mod handler;
mod local;

/// The closed set of commands an aggregate accepts, usually an enum.
///
/// The variant name is the [`CommandName`] and the variant content is the payload.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity of the aggregate instance this command is addressed to.
    fn target_id(&self) -> String;
}

/// A command as it travels through buses: routing data plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    name: CommandName,
    aggregate_type: AggregateType,
    aggregate_id: String,
    payload: Value,
}

impl CommandEnvelope {
    pub fn new(
        name: impl Into<CommandName>,
        aggregate_type: impl Into<AggregateType>,
        aggregate_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
        }
    }

    /// Wraps a typed command addressed to an instance of `A`.
    pub fn for_aggregate<A: Aggregate>(command: &A::Command) -> Result<Self, Error> {
        let (name, payload) = encode_variant(command)?;
        Ok(Self::new(name, A::TYPE, command.target_id(), payload))
    }

    pub fn name(&self) -> &CommandName {
        &self.name
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Rebuilds the typed command this envelope was made from.
    pub fn decode<C>(&self) -> Result<C, serde_json::Error>
    where
        C: DeserializeOwned,
    {
        decode_variant(self.name.as_str(), &self.payload)
    }
}

/// Maps every [`CommandName`] to the aggregate type that handles it.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<CommandName, AggregateType>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if the name is already registered; the existing
    /// registration is left untouched.
    pub fn register(&self, name: impl Into<CommandName>, aggregate_type: impl Into<AggregateType>) -> Result<(), Error> {
        let name: CommandName = name.into();
        let aggregate_type: AggregateType = aggregate_type.into();

        if name.is_empty() || aggregate_type.is_empty() {
            return Err(Error::configuration("command name and aggregate type must not be empty"));
        }

        let mut commands = self.write();
        if commands.contains_key(&name) {
            return Err(Error::configuration(format!("command `{name}` registered twice")));
        }

        commands.insert(name, aggregate_type);
        Ok(())
    }

    /// Registers every given command name as handled by `A`.
    pub fn register_for<A: Aggregate>(&self, names: &[&str]) -> Result<(), Error> {
        names.iter().try_for_each(|name| self.register(*name, A::TYPE))
    }

    /// Aggregate type a command name routes to.
    pub fn target(&self, name: &CommandName) -> Result<AggregateType, Error> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| NotFound::Command(name.clone()).into())
    }

    /// Builds a routable envelope out of decoded wire data.
    pub fn materialize(&self, name: impl Into<CommandName>, aggregate_id: impl Into<String>, payload: Value) -> Result<CommandEnvelope, Error> {
        let name: CommandName = name.into();
        let aggregate_type = self.target(&name)?;
        Ok(CommandEnvelope::new(name, aggregate_type, aggregate_id, payload))
    }

    /// Checks that the command is registered and addressed to the aggregate type that handles it.
    pub fn verify(&self, command: &CommandEnvelope) -> Result<(), Error> {
        let expected = self.target(command.name())?;
        if &expected != command.aggregate_type() {
            return Err(Error::Mismatch {
                expected,
                found: command.aggregate_type().clone(),
            });
        }
        Ok(())
    }

    /// Every registered command with its aggregate type, ordered by name.
    pub fn commands(&self) -> Vec<(CommandName, AggregateType)> {
        let mut commands: Vec<(CommandName, AggregateType)> = self
            .read()
            .iter()
            .map(|(name, aggregate_type)| (name.clone(), aggregate_type.clone()))
            .collect();
        commands.sort();
        commands
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CommandName, AggregateType>> {
        self.commands.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CommandName, AggregateType>> {
        self.commands.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handles a command end to end.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &CommandEnvelope) -> Result<(), Error>;

    /// The name of the command handler, used as part of tracing spans.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Routes commands to the handler registered for their name.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// # Errors
    ///
    /// Will return a [`Error::Configuration`] if a handler is already registered for `name`.
    async fn register_handler(&self, name: CommandName, handler: Arc<dyn CommandHandler>) -> Result<(), Error>;

    /// Accepts a command for handling.
    ///
    /// Returning `Ok` means the command was accepted; its outcome is reported by the returned
    /// [`Dispatched`].
    ///
    /// # Errors
    ///
    /// Will return [`NotFound::CommandHandler`] if no handler is registered for the command name.
    async fn dispatch(&self, command: CommandEnvelope) -> Result<Dispatched, Error>;
}
