use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::command::{CommandBus, CommandEnvelope, CommandHandler};
use crate::error::{Error, NotFound, TransportError};
use crate::types::CommandName;

/// Outcome of a command accepted by a [`CommandBus`].
///
/// Awaiting [`Dispatched::outcome`] reports whether the handler succeeded. Dropping it detaches the
/// handling, which keeps running; failures are still logged by the bus.
#[derive(Debug)]
pub struct Dispatched {
    command: CommandName,
    inner: DispatchedInner,
}

#[derive(Debug)]
enum DispatchedInner {
    Running(JoinHandle<Result<(), Error>>),
    Completed(Result<(), Error>),
}

impl Dispatched {
    /// A command whose handling runs on its own task.
    pub fn running(command: CommandName, handle: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            command,
            inner: DispatchedInner::Running(handle),
        }
    }

    /// A command that was handled before the bus returned.
    pub fn completed(command: CommandName, result: Result<(), Error>) -> Self {
        Self {
            command,
            inner: DispatchedInner::Completed(result),
        }
    }

    pub fn command(&self) -> &CommandName {
        &self.command
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            DispatchedInner::Running(handle) => handle.is_finished(),
            DispatchedInner::Completed(_) => true,
        }
    }

    /// Waits for the handler and returns its result.
    pub async fn outcome(self) -> Result<(), Error> {
        match self.inner {
            DispatchedInner::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(error) => Err(TransportError::Dispatch(error.to_string()).into()),
            },
            DispatchedInner::Completed(result) => result,
        }
    }
}

/// In-process [`CommandBus`]: every dispatched command is handled on a newly spawned task, so
/// callers never wait for the handler itself.
#[derive(Default)]
pub struct LocalCommandBus {
    handlers: RwLock<HashMap<CommandName, Arc<dyn CommandHandler>>>,
}

impl LocalCommandBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandBus for LocalCommandBus {
    async fn register_handler(&self, name: CommandName, handler: Arc<dyn CommandHandler>) -> Result<(), Error> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&name) {
            return Err(Error::configuration(format!(
                "a handler for command `{name}` is already registered"
            )));
        }

        handlers.insert(name, handler);
        Ok(())
    }

    async fn dispatch(&self, command: CommandEnvelope) -> Result<Dispatched, Error> {
        let handler: Arc<dyn CommandHandler> = self
            .handlers
            .read()
            .await
            .get(command.name())
            .cloned()
            .ok_or_else(|| NotFound::CommandHandler(command.name().clone()))?;

        let name = command.name().clone();
        let span = tracing::debug_span!(
            "eventide.command",
            command = %command.name(),
            aggregate_type = %command.aggregate_type(),
            aggregate_id = command.aggregate_id(),
            command_handler = handler.name(),
        );

        let handle = tokio::spawn(
            async move {
                let result = handler.handle(&command).await;
                if let Err(error) = &result {
                    tracing::error!({
                        command = %command.name(),
                        aggregate_id = command.aggregate_id(),
                        error = %error,
                    }, "command handler failed");
                }
                result
            }
            .instrument(span),
        );

        Ok(Dispatched::running(name, handle))
    }
}
